use prost::Message;
use std::env::var;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // List of proto files containing a service definition
    let proto_files = &["echo.proto"];

    // Name of the folder containing the proto definitions
    let proto_folder = "proto";
    let out_dir = PathBuf::from(var("OUT_DIR")?);

    println!("cargo:rerun-if-changed={proto_folder}");

    let file_descriptor_set = protox::compile(proto_files, [proto_folder])?;
    std::fs::write(
        out_dir.join("descriptors.bin"),
        file_descriptor_set.encode_to_vec(),
    )?;

    Ok(())
}
