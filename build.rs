pub fn main() {
    println!("cargo:rerun-if-changed=src/");
    println!("cargo:rerun-if-changed=Cargo.toml");

    #[cfg(feature = "uhd")]
    {
        if let Ok(dir) = std::env::var("UHD_LIB_DIR") {
            println!("cargo:rustc-link-search={dir}");
        }
        println!("cargo:rerun-if-env-changed=UHD_LIB_DIR");
        println!("cargo:rustc-link-lib=uhd");
    }
}
