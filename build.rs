fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Every generated map field becomes a BTreeMap: the domain types on the
    // other side of rpc::convert are BTreeMap-keyed throughout (spec §3.1),
    // so this keeps wire <-> domain conversions a plain `collect()` instead
    // of a HashMap/BTreeMap juggling act at every call site.
    tonic_build::configure().btree_map(["."]).compile(
        &["proto/nexa/machineruntime/v1/machine_runtime.proto"],
        &["proto"],
    )?;
    println!("cargo:rerun-if-changed=proto/nexa/machineruntime/v1/machine_runtime.proto");
    Ok(())
}
