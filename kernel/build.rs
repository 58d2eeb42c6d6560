fn main() {
    // Bare-metal riscv64 links against the board layout; host builds (unit
    // tests) use the platform defaults.
    let target = std::env::var("TARGET").unwrap_or_default();
    if target.starts_with("riscv64") {
        println!("cargo:rustc-link-arg-bins=-Tkernel/kernel.ld");
    }
    println!("cargo:rerun-if-changed=kernel.ld");
}
