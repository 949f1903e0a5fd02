/// This build script is used to link the lib's on-target test harness.

const LINKER_SCRIPT: &str = "src/platform/qemu_virt/linker/kernel.ld";

fn main() {
    println!("cargo:rerun-if-changed={}", LINKER_SCRIPT);
    println!("cargo:rustc-link-arg=--script={}", LINKER_SCRIPT);
}
