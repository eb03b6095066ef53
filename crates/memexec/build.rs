// build.rs for memexec
//
// Handles the optional `bundled` feature: when active, copies the converter
// executable (pointed to by `CONVERTER_BUNDLE_BIN`) into Cargo's output
// directory and generates a tiny Rust source file that embeds the bytes
// with `include_bytes!`.
//
// The embedded bytes are later written into an anonymous memory image and
// executed from there; the converter is never extracted to a named path.

use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=CONVERTER_BUNDLE_BIN");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_BUNDLED");

    if std::env::var("CARGO_FEATURE_BUNDLED").is_err() {
        return;
    }

    // ── Locate the converter ──────────────────────────────────────────────
    let bin_src = match std::env::var("CONVERTER_BUNDLE_BIN") {
        Ok(p) if !p.is_empty() => PathBuf::from(p),
        _ => {
            panic!(
                "\n\
                 ┌─────────────────────────────────────────────────────────┐\n\
                 │  memexec: `bundled` feature activated but               │\n\
                 │  `CONVERTER_BUNDLE_BIN` is not set.                     │\n\
                 │                                                         │\n\
                 │  Set it to the path of the converter executable:        │\n\
                 │                                                         │\n\
                 │  CONVERTER_BUNDLE_BIN=path/to/crop cargo build          │\n\
                 │                                                         │\n\
                 │  Or build without `bundled` and pass --converter-path   │\n\
                 │  (CONVERTER_PATH) to the server at startup.             │\n\
                 └─────────────────────────────────────────────────────────┘\n"
            )
        }
    };

    if !bin_src.is_file() {
        panic!(
            "memexec: CONVERTER_BUNDLE_BIN points to a file that does not exist: {}",
            bin_src.display()
        );
    }
    println!("cargo:rerun-if-changed={}", bin_src.display());

    // ── Copy into OUT_DIR with a fixed name ───────────────────────────────
    let out_dir = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR not set"));
    let bin_dest = out_dir.join("bundled_converter");

    std::fs::copy(&bin_src, &bin_dest).unwrap_or_else(|e| {
        panic!(
            "memexec: failed to copy {} → {}: {}",
            bin_src.display(),
            bin_dest.display(),
            e
        )
    });

    // `include_bytes!` needs a literal path at the expansion site, so the
    // invocation is generated here and pulled in with `include!()`.
    let bundled_rs = out_dir.join("bundled.rs");
    let code = r#"
/// The converter executable embedded at compile time.
pub static CONVERTER_BYTES: &[u8] = include_bytes!("bundled_converter");
"#;
    std::fs::write(&bundled_rs, code).unwrap_or_else(|e| {
        panic!(
            "memexec: failed to write {}: {}",
            bundled_rs.display(),
            e
        )
    });
}
