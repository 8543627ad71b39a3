fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/sampler.proto");
    tonic_build::compile_protos("proto/sampler.proto")?;
    Ok(())
}
