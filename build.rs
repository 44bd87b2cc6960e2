use std::env;

fn main() {
    println!("cargo:rerun-if-changed=src/kernel/kernel.ld");

    // The linker script only applies to the bare-metal kernel image.
    // Hosted builds (mkfs, unit tests) link normally.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("none") {
        println!("cargo:rustc-link-arg-bin=kernel=-Tsrc/kernel/kernel.ld");
    }
}
