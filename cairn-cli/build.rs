fn main() {
    println!("cargo:rerun-if-changed=../.git/HEAD");

    // Short commit hash, "unknown" outside a checkout
    let git_hash = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=CAIRN_GIT_HASH={}", git_hash);

    let build_date = chrono::Utc::now().format("%Y-%m-%d");
    println!("cargo:rustc-env=CAIRN_BUILD_DATE={}", build_date);
}
