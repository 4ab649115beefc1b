use std::env;
use std::path::PathBuf;

fn main() {
	println!("cargo:rerun-if-changed=../../proto");
	println!("cargo:rerun-if-changed=../../proto/parley.proto");

	let proto_dir = PathBuf::from("../../proto");
	let proto_file = proto_dir.join("parley.proto");

	let out_dir = PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR must be set by Cargo"));

	let protos = [proto_file];
	let includes = [proto_dir];

	let mut config = prost_build::Config::new();

	config.out_dir(out_dir);
	config.protoc_arg("--experimental_allow_proto3_optional");
	config.type_attribute(".parley.v1.Envelope.Msg", "#[allow(clippy::large_enum_variant)]");

	config
		.compile_protos(&protos, &includes)
		.expect("failed to compile protobuf definitions with prost");
}
