fn main() {
    // Portal pages are embedded with include_str!
    println!("cargo:rerun-if-changed=templates");

    // ESP-IDF environment is only needed for the espidf target; build
    // scripts run on the host, so check the target rather than cfg!
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}
