// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

// 构建脚本: 静态FFmpeg在Windows MSVC下需要额外的系统库
fn main() {
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let env = std::env::var("CARGO_CFG_TARGET_ENV").unwrap_or_default();
    if os != "windows" || env != "msvc" {
        return;
    }

    // x264 编码器 (video.codec = "libx264")
    println!("cargo:rustc-link-lib=dylib=libx264");

    // OLE 自动化和VFW
    println!("cargo:rustc-link-lib=dylib=oleaut32");
    println!("cargo:rustc-link-lib=dylib=vfw32");

    // Secure Channel (TLS/SSL)
    println!("cargo:rustc-link-lib=dylib=secur32");
}
