use batchq::config::{Config, DEFAULT_DATABASE_URL, ProjectConfig, RunConfig};
use batchq::error::Error;
use secrecy::ExposeSecret;
use std::io::Write;

// Environment variables are process-wide, so every env case lives in one
// test to keep them from racing.
#[test]
fn config_from_env_reads_and_defaults() {
    unsafe {
        std::env::set_var("DATABASE_URL", "sqlite://test.db");
        std::env::set_var("OTEL_ENDPOINT", "http://localhost:4317");
        std::env::set_var("LOG_LEVEL", "batchq=debug");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.database_url.expose_secret(), "sqlite://test.db");
    assert_eq!(config.otel_endpoint.as_deref(), Some("http://localhost:4317"));
    assert_eq!(config.log_level, "batchq=debug");

    unsafe {
        std::env::remove_var("DATABASE_URL");
        std::env::set_var("OTEL_ENDPOINT", "");
        std::env::remove_var("LOG_LEVEL");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.database_url.expose_secret(), DEFAULT_DATABASE_URL);
    assert_eq!(config.otel_endpoint, None);
    assert_eq!(config.log_level, "info");

    unsafe {
        std::env::remove_var("OTEL_ENDPOINT");
    }
}

#[test]
fn database_url_is_redacted_in_debug_output() {
    let config = Config {
        database_url: "sqlite://secret-path.db".to_string().into(),
        otel_endpoint: None,
        log_level: "info".to_string(),
    };
    assert!(!format!("{config:?}").contains("secret-path"));
}

#[test]
fn project_file_loads_run_source_and_schema() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[run]
run_name = "geocode"
batch_size = 50
max_retries = 1
pool_size = 8

[run.cache]
enabled = true
capacity = 10

[source]
path = "cities.csv"
delimiter = ","

[schema]
primary_key = "id"
business_fields = ["city"]
result_fields = ["lat", "lon"]
"#
    )
    .unwrap();

    let project = ProjectConfig::load(file.path()).unwrap();
    assert_eq!(project.run.run_name, "geocode");
    assert_eq!(project.run.batch_size, 50);
    assert_eq!(project.run.max_retries, 1);
    assert_eq!(project.run.pool_size, 8);
    assert_eq!(project.run.cache.capacity, 10);

    let source = project.source.unwrap();
    assert_eq!(source.delimiter, ',');

    let schema = project.schema.unwrap();
    assert_eq!(schema.result_fields, ["lat", "lon"]);
    assert_eq!(schema.control_fields, ["is_processed", "retry_count"]);

    let run = RunConfig::load(file.path()).unwrap();
    assert_eq!(run.run_name, "geocode");
}

#[test]
fn invalid_project_files_are_rejected() {
    let zero_pool = "[run]\nrun_name = \"r\"\npool_size = 0\n";
    assert!(matches!(
        ProjectConfig::from_toml(zero_pool),
        Err(Error::Config(_))
    ));

    let no_control = "[run]\nrun_name = \"r\"\n[schema]\nprimary_key = \"id\"\ncontrol_fields = [\"is_processed\"]\n";
    assert!(matches!(
        ProjectConfig::from_toml(no_control),
        Err(Error::SchemaMismatch(_))
    ));

    assert!(matches!(
        ProjectConfig::from_toml("[run]\nbatch_size = 3\n"),
        Err(Error::Toml(_))
    ));

    assert!(matches!(
        RunConfig::load(std::path::Path::new("/nonexistent/batchq.toml")),
        Err(Error::Config(_))
    ));
}
