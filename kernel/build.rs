/// This build script is used to link the main kernel binary.

const LINKER_SCRIPT: &str = "../machine/src/platform/qemu_virt/linker/kernel.ld";

fn main() {
    println!("cargo:rerun-if-changed={}", LINKER_SCRIPT);
    println!("cargo:rustc-link-arg=--script={}", LINKER_SCRIPT);
}
