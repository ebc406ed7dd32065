// The catalog migrations are embedded with `sqlx::migrate!`, which only reads the
// directory at compile time. Rebuild whenever a migration is added or edited.
fn main() {
    println!("cargo:rerun-if-changed=migrations");
}
