use grillo_core::registry::Resolution;
use grillo_core::{MethodKey, SchemaError, SchemaLoader, StreamingMode};
use prost::Message;
use prost_types::FileDescriptorSet;
use std::path::Path;

fn write(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

const COMMON_PROTO: &str = r#"
syntax = "proto3";
package common;

message Ack {
  bool ok = 1;
}
"#;

const USERS_PROTO: &str = r#"
syntax = "proto3";
package users;

import "common.proto";

message User { string name = 1; }

service Users {
  rpc Create(User) returns (common.Ack);
  rpc Watch(User) returns (stream User);
}
"#;

const ORDERS_PROTO: &str = r#"
syntax = "proto3";
package orders;

import "common.proto";

message Order { string id = 1; }

service Orders {
  rpc Create(Order) returns (common.Ack);
}
"#;

#[test]
fn test_loads_proto_sources_from_include_path() {
    let mut loader = SchemaLoader::new([echo_service::PROTO_DIR]);
    loader.add_proto_files(["echo.proto"]).unwrap();
    let registry = loader.finish();

    let service = registry.service(echo_service::SERVICE).unwrap();
    assert_eq!(service.methods().count(), 4);

    let modes: Vec<_> = registry
        .methods()
        .map(|(key, method)| (key.method().to_string(), StreamingMode::from(method)))
        .collect();
    assert_eq!(
        modes,
        vec![
            ("Chat".to_string(), StreamingMode::Bidirectional),
            ("Collect".to_string(), StreamingMode::ClientStreaming),
            ("Count".to_string(), StreamingMode::ServerStreaming),
            ("Say".to_string(), StreamingMode::Unary),
        ]
    );
}

#[test]
fn test_loads_encoded_descriptor_sets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo.protoset");
    std::fs::write(&path, echo_service::FILE_DESCRIPTOR_SET).unwrap();

    let mut loader = SchemaLoader::default();
    loader.add_sources([&path]).unwrap();
    let registry = loader.finish();

    assert!(
        registry
            .method(&MethodKey::new("echo.Echo", "Say"))
            .is_some()
    );
}

#[test]
fn test_shared_imports_are_loaded_once() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "common.proto", COMMON_PROTO);
    write(dir.path(), "users.proto", USERS_PROTO);
    write(dir.path(), "orders.proto", ORDERS_PROTO);

    let mut loader = SchemaLoader::new([dir.path()]);
    loader.add_sources(["users.proto"]).unwrap();
    loader.add_sources(["orders.proto"]).unwrap();
    let registry = loader.finish();

    assert_eq!(registry.services().count(), 2);
    assert!(registry.descriptor_pool().get_message_by_name("common.Ack").is_some());

    assert_eq!(
        registry.resolve("users.Users/Watch"),
        Resolution::Found(MethodKey::new("users.Users", "Watch"))
    );
    assert_eq!(
        registry.resolve("Watch"),
        Resolution::Found(MethodKey::new("users.Users", "Watch"))
    );
    assert!(matches!(registry.resolve("Create"), Resolution::Ambiguous(c) if c.len() == 2));
    assert_eq!(registry.resolve("Delete"), Resolution::NotFound);
}

#[test]
fn test_descriptor_sets_and_sources_share_imports() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "common.proto", COMMON_PROTO);
    write(dir.path(), "users.proto", USERS_PROTO);
    write(dir.path(), "orders.proto", ORDERS_PROTO);

    // Compiled with source info, unlike the loader's own compilation.
    let users = protox::compile(["users.proto"], [dir.path()]).unwrap();
    let users_set = dir.path().join("users.pb");
    std::fs::write(&users_set, users.encode_to_vec()).unwrap();

    let mut loader = SchemaLoader::new([dir.path()]);
    loader.add_sources([&users_set]).unwrap();
    loader.add_sources(["orders.proto"]).unwrap();
    let registry = loader.finish();

    assert!(registry.service("users.Users").is_some());
    assert!(registry.service("orders.Orders").is_some());
}

#[test]
fn test_same_schema_from_both_kinds_of_source() {
    let mut loader = SchemaLoader::new([echo_service::PROTO_DIR]);
    loader
        .add_file_descriptor_set(echo_service::FILE_DESCRIPTOR_SET)
        .unwrap();
    loader.add_proto_files(["echo.proto"]).unwrap();
    let registry = loader.finish();

    assert_eq!(registry.services().count(), 1);
    assert_eq!(registry.methods().count(), 4);
}

#[test]
fn test_files_outside_include_paths_resolve_siblings() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "common.proto", COMMON_PROTO);
    write(dir.path(), "users.proto", USERS_PROTO);

    let mut loader = SchemaLoader::default();
    loader.add_sources([dir.path().join("users.proto")]).unwrap();

    assert!(loader.finish().service("users.Users").is_some());
}

#[test]
fn test_unresolved_import_is_a_schema_error() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "users.proto", USERS_PROTO);

    let mut loader = SchemaLoader::new([dir.path()]);
    let err = loader.add_sources(["users.proto"]).unwrap_err();

    assert!(matches!(err, SchemaError::Compile(_)));
    assert!(loader.finish().is_empty());
}

#[test]
fn test_unresolved_descriptor_dependency_is_a_schema_error() {
    let mut set = FileDescriptorSet::decode(echo_service::FILE_DESCRIPTOR_SET).unwrap();
    for file in &mut set.file {
        file.dependency.push("missing.proto".to_string());
    }

    let mut loader = SchemaLoader::default();
    let err = loader
        .add_file_descriptor_set(&set.encode_to_vec())
        .unwrap_err();

    assert!(matches!(err, SchemaError::Resolve(_)));
}

#[test]
fn test_malformed_descriptor_set() {
    let mut loader = SchemaLoader::default();
    let err = loader
        .add_file_descriptor_set(b"definitely not protobuf")
        .unwrap_err();

    assert!(matches!(err, SchemaError::Decode { .. }));
}

#[test]
fn test_duplicate_service_is_rejected_and_previous_schema_kept() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "echo_copy.proto",
        r#"
syntax = "proto3";
package echo;

message Ping { string text = 1; }

service Echo {
  rpc Say(Ping) returns (Ping);
}
"#,
    );

    let mut loader = SchemaLoader::new([dir.path()]);
    loader
        .add_file_descriptor_set(echo_service::FILE_DESCRIPTOR_SET)
        .unwrap();

    let err = loader.add_sources(["echo_copy.proto"]).unwrap_err();
    assert!(matches!(
        err,
        SchemaError::DuplicateService { ref service, .. } if service == "echo.Echo"
    ));

    let registry = loader.finish();
    assert_eq!(registry.services().count(), 1);
    assert!(
        registry
            .method(&MethodKey::new("echo.Echo", "Chat"))
            .is_some()
    );
}

#[test]
fn test_missing_file_is_an_error() {
    let mut loader = SchemaLoader::default();
    let err = loader.add_sources(["/nonexistent/schema.pb"]).unwrap_err();

    assert!(matches!(err, SchemaError::Io { .. }));
}
