use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

fn main() {
    println!("cargo:rerun-if-changed=bpf/");
    println!("cargo:rerun-if-changed=build.rs");

    // The BPF object is only embedded when kprobe support is compiled in.
    if env::var_os("CARGO_FEATURE_BPF").is_none() {
        return;
    }

    // BPF compilation is Linux-only.
    if env::var("CARGO_CFG_TARGET_OS").unwrap_or_default() != "linux" {
        println!("cargo:warning=BPF compilation skipped on non-Linux target");
        return;
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
    let manifest_dir =
        PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));

    let bpf_src = manifest_dir.join("bpf/iomigrater.bpf.c");
    let bpf_out = out_dir.join("iomigrater.bpf.o");

    generate_vmlinux_header(&out_dir.join("vmlinux.h"));

    // Determine target architecture for BPF.
    let target_arch = match env::var("CARGO_CFG_TARGET_ARCH")
        .unwrap_or_default()
        .as_str()
    {
        "x86_64" => "x86",
        "aarch64" => "arm64",
        arch => {
            println!("cargo:warning=Unsupported BPF target arch: {arch}, defaulting to x86");
            "x86"
        }
    };

    let bpf_cflags = format!("-D__TARGET_ARCH_{target_arch}");

    let status = Command::new("clang")
        .args([
            "-O2",
            "-g",
            "-Wall",
            "-target",
            "bpf",
            &bpf_cflags,
            "-I",
            out_dir.to_str().expect("valid path"),
            "-c",
            bpf_src.to_str().expect("valid path"),
            "-o",
            bpf_out.to_str().expect("valid path"),
        ])
        .status()
        .expect("failed to execute clang - is it installed?");

    if !status.success() {
        eprintln!("BPF compilation failed with status: {status}");
        std::process::exit(1);
    }
}

/// Dump kernel BTF as C so the program can use CO-RE relocations.
fn generate_vmlinux_header(dest: &Path) {
    let btf = env::var("IOMIGRATER_BTF").unwrap_or_else(|_| "/sys/kernel/btf/vmlinux".to_string());
    println!("cargo:rerun-if-env-changed=IOMIGRATER_BTF");

    let header = File::create(dest).expect("creating vmlinux.h");
    let status = Command::new("bpftool")
        .args(["btf", "dump", "file", &btf, "format", "c"])
        .stdout(Stdio::from(header))
        .status()
        .expect("failed to execute bpftool - is it installed?");

    if !status.success() {
        eprintln!("bpftool btf dump of {btf} failed with status: {status}");
        std::process::exit(1);
    }
}
