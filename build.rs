fn main() {
    // ── macOS: embed Info.plist so CoreBluetooth grants Bluetooth access ──────
    //
    // CBCentralManager stays "unauthorised" for a bare CLI binary unless the
    // Mach-O carries an Info.plist with NSBluetoothAlwaysUsageDescription.
    // The linker's `-sectcreate` flag places it in `__TEXT,__info_plist`.
    //
    // `CARGO_CFG_TARGET_OS` is the *target* OS, so cross builds work too.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos") {
        let dir = std::env::var("CARGO_MANIFEST_DIR")
            .expect("CARGO_MANIFEST_DIR must be set by Cargo");

        let plist = format!("{dir}/Info.plist");

        println!("cargo:rustc-link-arg=-sectcreate");
        println!("cargo:rustc-link-arg=__TEXT");
        println!("cargo:rustc-link-arg=__info_plist");
        println!("cargo:rustc-link-arg={plist}");

        println!("cargo:rerun-if-changed=Info.plist");
    }
}
