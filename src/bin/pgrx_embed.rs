#[allow(non_snake_case)]
fn main() {
    pgrx::pgrx_embed!();
}
