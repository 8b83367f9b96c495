//! Configuration loading and precedence tests

use ctypes_config::{
    ConfigError, ConfigLoader, ConventionName, DataModelName, EngineConfig,
};
use pretty_assertions::assert_eq;
use rstest::rstest;
use serial_test::serial;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn create_config_file(dir: &Path, content: &str) -> PathBuf {
    let config_path = dir.join("ctypes.toml");
    fs::write(&config_path, content).unwrap();
    config_path
}

fn isolated_loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_global_config_path(dir.path().join("absent-global.toml"))
}

fn clear_env() {
    env::remove_var("CTYPES_DATA_MODEL");
    env::remove_var("CTYPES_LIBRARY_PATH");
    env::remove_var("CTYPES_ALLOW_FOREIGN_READS");
}

// ============================================================================
// Config Loading Tests
// ============================================================================

#[test]
#[serial]
fn test_load_function_declarations() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    let content = r#"
[functions.strlen]
args = ["char*"]
returns = "size_t"

[functions.c_abs]
symbol = "abs"
args = ["int"]
returns = "int"

[functions.snprintf]
args = ["char*", "size_t", "char*"]
returns = "int"
variadic = true
"#;
    create_config_file(temp_dir.path(), content);

    let mut loader = isolated_loader(&temp_dir);
    let config = loader.load_from_directory(temp_dir.path()).unwrap();

    let functions = &config.engine.functions;
    assert_eq!(functions.len(), 3);
    assert_eq!(functions["c_abs"].symbol_name("c_abs"), "abs");
    assert_eq!(functions["snprintf"].args.len(), 3);
    assert!(functions["snprintf"].variadic);
    assert_eq!(functions["strlen"].convention, ConventionName::Default);
}

#[test]
#[serial]
fn test_load_from_explicit_file() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    let path = create_config_file(temp_dir.path(), "[platform]\nwchar_size = 2\n");

    let mut loader = isolated_loader(&temp_dir);
    let config = loader.load_from_file(&path).unwrap();

    assert_eq!(config.engine.wchar_size(), Some(2));
    assert_eq!(config.project_root(), Some(temp_dir.path()));
}

#[test]
fn test_missing_explicit_file_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let result = EngineConfig::load_from_file(&temp_dir.path().join("missing.toml"));
    assert!(matches!(result, Err(ConfigError::NotFound(_))));
}

#[test]
fn test_unknown_section_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_config_file(temp_dir.path(), "[compiler]\noptimize = true\n");
    let result = EngineConfig::load_from_file(&path);
    assert!(matches!(result, Err(ConfigError::TomlParseError { .. })));
}

#[test]
fn test_empty_argument_type_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_config_file(
        temp_dir.path(),
        "[functions.broken]\nargs = [\"int\", \" \"]\n",
    );
    let err = EngineConfig::load_from_file(&path).unwrap_err();
    match err {
        ConfigError::InvalidValue { field, .. } => assert_eq!(field, "functions.broken.args[1]"),
        other => panic!("unexpected error: {other}"),
    }
}

#[rstest]
#[case("native", DataModelName::Native)]
#[case("lp64", DataModelName::Lp64)]
#[case("llp64", DataModelName::Llp64)]
#[case("ilp32", DataModelName::Ilp32)]
fn test_data_model_names(#[case] name: &str, #[case] expected: DataModelName) {
    let content = format!("[platform]\ndata_model = \"{}\"\n", name);
    let config = EngineConfig::from_toml_str(&content, Path::new("ctypes.toml")).unwrap();
    assert_eq!(config.data_model(), expected);
}

// ============================================================================
// Precedence Tests
// ============================================================================

#[test]
#[serial]
fn test_env_library_path_prepended() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    create_config_file(
        temp_dir.path(),
        "[library]\nsearch_paths = [\"/project/lib\"]\n",
    );

    let joined = env::join_paths([PathBuf::from("/env/a"), PathBuf::from("/env/b")]).unwrap();
    env::set_var("CTYPES_LIBRARY_PATH", joined);
    let mut loader = isolated_loader(&temp_dir);
    let config = loader.load_from_directory(temp_dir.path()).unwrap();
    clear_env();

    assert_eq!(
        config.engine.search_paths(),
        &[
            PathBuf::from("/env/a"),
            PathBuf::from("/env/b"),
            PathBuf::from("/project/lib"),
        ]
    );
}

#[test]
#[serial]
fn test_env_foreign_reads_override() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    create_config_file(temp_dir.path(), "[memory]\nallow_foreign_reads = true\n");

    env::set_var("CTYPES_ALLOW_FOREIGN_READS", "no");
    let mut loader = isolated_loader(&temp_dir);
    let config = loader.load_from_directory(temp_dir.path()).unwrap();
    clear_env();

    assert!(!config.engine.allow_foreign_reads());
}

#[test]
#[serial]
fn test_project_functions_override_global() {
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    let global = temp_dir.path().join("global.toml");
    fs::write(
        &global,
        "[functions.abs]\nargs = [\"long\"]\nreturns = \"long\"\n\n[functions.puts]\nargs = [\"char*\"]\nreturns = \"int\"\n",
    )
    .unwrap();
    let project = temp_dir.path().join("app");
    fs::create_dir_all(&project).unwrap();
    create_config_file(&project, "[functions.abs]\nargs = [\"int\"]\nreturns = \"int\"\n");

    let mut loader = ConfigLoader::with_global_config_path(&global);
    let config = loader.load_from_directory(&project).unwrap();

    assert_eq!(config.engine.functions["abs"].args, vec!["int".to_string()]);
    assert!(config.engine.functions.contains_key("puts"));
}

#[test]
fn test_serialized_config_snapshot() {
    let content = r#"
[platform]
data_model = "llp64"
wchar_size = 2

[functions.MessageBeep]
library = "user32"
args = ["uint32"]
returns = "int32"
convention = "stdcall"
"#;
    let config = EngineConfig::from_toml_str(content, Path::new("ctypes.toml")).unwrap();
    insta::assert_json_snapshot!(config, @r###"
    {
      "platform": {
        "data_model": "llp64",
        "wchar_size": 2
      },
      "functions": {
        "MessageBeep": {
          "library": "user32",
          "args": [
            "uint32"
          ],
          "returns": "int32",
          "convention": "stdcall",
          "variadic": false
        }
      }
    }
    "###);
}
