//! Stamps the CLI with when and how it was built.

use time::macros::format_description;
use time::OffsetDateTime;

/// Set `RAYFLOW_*` for the compiler, letting an identically named variable
/// in the build environment win.
fn stamp(name: &str, value: impl FnOnce() -> String) {
    let key = format!("RAYFLOW_{}", name);
    println!("cargo:rerun-if-env-changed={}", key);
    let value = std::env::var(&key).unwrap_or_else(|_| value());
    println!("cargo:rustc-env={}={}", key, value);
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    // Reproducible builds pin the clock
    let built = std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);

    stamp("BUILD_DATE", || {
        built
            .format(format_description!("[year]-[month]-[day]"))
            .unwrap_or_else(|_| "unknown".into())
    });
    stamp("BUILD_TIME", || {
        built
            .format(format_description!("[hour]:[minute]:[second] UTC"))
            .unwrap_or_else(|_| "unknown".into())
    });
    stamp("BUILD_PROFILE", || std::env::var("PROFILE").unwrap_or_else(|_| "unknown".into()));
    stamp("BUILD_TARGET", || std::env::var("TARGET").unwrap_or_else(|_| "unknown".into()));
}
