fn main() {
    // Stamped into the `version` subcommand
    println!(
        "cargo:rustc-env=VK_BUILD_TIME={}",
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    );
    println!("cargo:rerun-if-changed=build.rs");
}
