use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn pdfchat_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("pdfchat");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    fs::create_dir_all(root.join("config")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/pdfchat.sqlite"

[llm]
provider = "ollama"
models = ["llama3"]
condense_model = "llama3"
url = "http://127.0.0.1:9"

[server]
bind = "127.0.0.1:0"
"#,
        root.display()
    );
    let config_path = root.join("config/pdfchat.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run(config: &Path, args: &[&str]) -> Output {
    Command::new(pdfchat_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("failed to run pdfchat")
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config) = setup_test_env();

    let first = run(&config, &["init"]);
    assert!(first.status.success(), "{}", String::from_utf8_lossy(&first.stderr));
    let second = run(&config, &["init"]);
    assert!(second.status.success());
    assert!(String::from_utf8_lossy(&second.stdout).contains("initialized"));
}

#[test]
fn test_pdfs_empty_after_init() {
    let (_tmp, config) = setup_test_env();
    run(&config, &["init"]);

    let output = run(&config, &["pdfs"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No PDFs indexed."));
}

#[test]
fn test_conversation_for_unknown_pdf_fails() {
    let (_tmp, config) = setup_test_env();
    run(&config, &["init"]);

    let output = run(&config, &["conversation", "new", "--pdf", "missing"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("pdf not found"));
}

#[test]
fn test_index_rejects_non_pdf() {
    let (tmp, config) = setup_test_env();
    run(&config, &["init"]);
    let notes = tmp.path().join("notes.txt");
    fs::write(&notes, "plain text, not a pdf").unwrap();

    let output = run(&config, &["index", notes.to_str().unwrap()]);
    assert!(!output.status.success());
}

#[test]
fn test_history_for_unknown_conversation_fails() {
    let (_tmp, config) = setup_test_env();
    run(&config, &["init"]);

    let output = run(&config, &["history", "nope"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("conversation not found"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let output = run(&tmp.path().join("absent.toml"), &["init"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to read config file"));
}
