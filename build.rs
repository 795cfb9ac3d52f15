fn main() {
    // Version info resource is only meaningful for the Windows executable
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("windows") {
        let res = winres::WindowsResource::new();
        if let Err(e) = res.compile() {
            println!("cargo:warning=failed to embed version resource: {e}");
        }
    }
}
