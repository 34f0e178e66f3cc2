//! CLI integration tests
//!
//! Tests the command-line interface end-to-end.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

/// Small scrypt budgets so parameter generation stays fast.
const FAST_BUDGETS: &[&str] = &["--maxmem", "1048576", "--maxtime", "0.01"];

/// Magic plus nonce in front of every encrypted stream.
const HEADER_LEN: usize = 16;

/// Get path to the scryptctr binary
fn scryptctr_bin() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // Remove test binary name
    path.pop(); // Remove deps/
    path.push("scryptctr");
    path
}

/// Run scryptctr with passphrase from stdin
fn run_with_passphrase(args: &[&str], passphrase: &str) -> Output {
    run_with_env(args, passphrase, &[])
}

fn run_with_env(args: &[&str], passphrase: &str, env: &[(&str, &str)]) -> Output {
    let mut child = Command::new(scryptctr_bin())
        .arg("--passphrase-stdin")
        .args(args)
        .envs(env.iter().copied())
        .env_remove("SCRYPTCTR_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn scryptctr");

    {
        let stdin = child.stdin.as_mut().expect("failed to open stdin");
        // The command may exit before reading stdin if it fails early.
        let _ = stdin.write_all(passphrase.as_bytes());
    }

    child.wait_with_output().expect("failed to wait for scryptctr")
}

fn assert_success(output: &Output, what: &str) {
    assert!(
        output.status.success(),
        "{} failed: {}",
        what,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn s(path: &Path) -> &str {
    path.to_str().unwrap()
}

/// Get path to testdata directory
fn testdata_path(filename: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("testdata");
    path.push(filename);
    path
}

fn encrypt(input: &Path, output: &Path, params: &Path, passphrase: &str) -> Output {
    let mut args = FAST_BUDGETS.to_vec();
    args.extend(["encrypt", "-i", s(input), "-o", s(output), "--params", s(params)]);
    run_with_passphrase(&args, passphrase)
}

fn decrypt(input: &Path, output: &Path, params: &Path, passphrase: &str) -> Output {
    run_with_passphrase(
        &["decrypt", "-i", s(input), "-o", s(output), "--params", s(params)],
        passphrase,
    )
}

#[test]
fn test_capabilities_lists_transforms() {
    let output = run_with_passphrase(&["capabilities"], "");
    assert_success(&output, "capabilities");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let names: Vec<_> = stdout
        .lines()
        .map(|line| line.split('\t').next().unwrap_or_default())
        .collect();
    assert_eq!(names, ["crypt.scrypt", "crypt.aesctr256"]);
}

#[test]
fn test_encrypt_decrypt_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let plain = temp_dir.path().join("plain.txt");
    let crypt = temp_dir.path().join("plain.txt.ctr");
    let params = temp_dir.path().join("plain.params");
    let decrypted = temp_dir.path().join("decrypted.txt");
    fs::write(&plain, "Hello, World!").unwrap();

    assert_success(&encrypt(&plain, &crypt, &params, "test"), "encrypt");
    assert!(params.exists(), "encrypt should generate missing parameters");
    assert_ne!(fs::read(&crypt).unwrap(), b"Hello, World!");
    assert_eq!(fs::read(&crypt).unwrap().len(), HEADER_LEN + 13);

    assert_success(&decrypt(&crypt, &decrypted, &params, "test"), "decrypt");
    assert_eq!(fs::read_to_string(&decrypted).unwrap(), "Hello, World!");
}

#[test]
fn test_params_then_encrypt_reuses_them() {
    let temp_dir = TempDir::new().unwrap();
    let params = temp_dir.path().join("params");
    let plain = temp_dir.path().join("plain.txt");
    fs::write(&plain, "same key twice").unwrap();

    let mut args = FAST_BUDGETS.to_vec();
    args.extend(["params", "-o", s(&params)]);
    assert_success(&run_with_passphrase(&args, ""), "params");
    let generated = fs::read(&params).unwrap();
    assert!(String::from_utf8_lossy(&generated).starts_with("scryptctr1:"));

    let a = temp_dir.path().join("a.ctr");
    let b = temp_dir.path().join("b.ctr");
    assert_success(&encrypt(&plain, &a, &params, "pw"), "encrypt a");
    assert_success(&encrypt(&plain, &b, &params, "pw"), "encrypt b");
    assert_eq!(fs::read(&params).unwrap(), generated);

    // Same parameters and passphrase, but each file gets its own keystream.
    let (a_bytes, b_bytes) = (fs::read(&a).unwrap(), fs::read(&b).unwrap());
    assert_eq!(a_bytes.len(), b_bytes.len());
    assert_ne!(a_bytes[HEADER_LEN..], b_bytes[HEADER_LEN..]);
    for (crypt, name) in [(&a, "a.txt"), (&b, "b.txt")] {
        let out = temp_dir.path().join(name);
        assert_success(&decrypt(crypt, &out, &params, "pw"), "decrypt");
        assert_eq!(fs::read_to_string(&out).unwrap(), "same key twice");
    }

    // Refuses to replace existing parameters.
    let output = run_with_passphrase(&args, "");
    assert!(!output.status.success());
    assert_eq!(fs::read(&params).unwrap(), generated);
}

#[test]
fn test_decrypt_without_params_fails() {
    let temp_dir = TempDir::new().unwrap();
    let crypt = temp_dir.path().join("c.ctr");
    let output_path = temp_dir.path().join("out.txt");
    fs::write(&crypt, b"ciphertext").unwrap();

    let output = decrypt(&crypt, &output_path, &temp_dir.path().join("missing"), "test");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
    assert!(!output_path.exists());
}

#[test]
fn test_decrypt_nonexistent_file_fails() {
    let temp_dir = TempDir::new().unwrap();
    let plain = temp_dir.path().join("plain.txt");
    let params = temp_dir.path().join("params");
    fs::write(&plain, "x").unwrap();
    assert_success(
        &encrypt(&plain, &temp_dir.path().join("c"), &params, "test"),
        "encrypt",
    );

    let output = decrypt(
        &temp_dir.path().join("nonexistent.ctr"),
        &temp_dir.path().join("output.txt"),
        &params,
        "test",
    );
    assert!(!output.status.success(), "Should fail for nonexistent file");
}

#[test]
fn test_empty_file_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let plain = temp_dir.path().join("empty.txt");
    let crypt = temp_dir.path().join("empty.ctr");
    let params = temp_dir.path().join("params");
    let decrypted = temp_dir.path().join("decrypted.txt");
    fs::write(&plain, "").unwrap();

    assert_success(&encrypt(&plain, &crypt, &params, "test"), "encrypt");
    assert_eq!(fs::read(&crypt).unwrap().len(), HEADER_LEN);
    assert_success(&decrypt(&crypt, &decrypted, &params, "test"), "decrypt");
    assert_eq!(fs::read(&decrypted).unwrap().len(), 0);
}

#[test]
fn test_large_file_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let plain = temp_dir.path().join("large.bin");
    let crypt = temp_dir.path().join("large.ctr");
    let params = temp_dir.path().join("params");
    let decrypted = temp_dir.path().join("decrypted.bin");

    // Spans many pipe chunks and ends mid-chunk.
    let data: Vec<u8> = (0..1_000_003u32).map(|i| (i % 251) as u8).collect();
    fs::write(&plain, &data).unwrap();

    assert_success(&encrypt(&plain, &crypt, &params, "test"), "encrypt");
    assert_success(&decrypt(&crypt, &decrypted, &params, "test"), "decrypt");
    assert_eq!(fs::read(&decrypted).unwrap(), data);
}

#[test]
fn test_seal_open_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let plain = temp_dir.path().join("plain.txt");
    let sealed = temp_dir.path().join("plain.sealed");
    let opened = temp_dir.path().join("opened.txt");
    fs::write(&plain, "sealed with a MAC").unwrap();

    let mut args = FAST_BUDGETS.to_vec();
    args.extend(["seal", "--armor", "-i", s(&plain), "-o", s(&sealed)]);
    assert_success(&run_with_passphrase(&args, "test"), "seal");
    assert!(fs::read_to_string(&sealed).unwrap().starts_with("scryptctr1:"));

    let output = run_with_passphrase(&["open", "-i", s(&sealed), "-o", s(&opened)], "test");
    assert_success(&output, "open");
    assert_eq!(fs::read_to_string(&opened).unwrap(), "sealed with a MAC");
}

#[test]
fn test_open_known_container() {
    let temp_dir = TempDir::new().unwrap();
    let opened = temp_dir.path().join("hello.txt");

    let output = run_with_passphrase(
        &[
            "open",
            "-i",
            s(&testdata_path("hello.txt.sealed")),
            "-o",
            s(&opened),
        ],
        "correct horse",
    );
    assert_success(&output, "open");
    assert_eq!(
        fs::read(&opened).unwrap(),
        fs::read(testdata_path("hello.txt")).unwrap()
    );
}

#[test]
fn test_open_wrong_passphrase_fails() {
    let temp_dir = TempDir::new().unwrap();
    let opened = temp_dir.path().join("hello.txt");

    let output = run_with_passphrase(
        &[
            "open",
            "-i",
            s(&testdata_path("hello.txt.sealed")),
            "-o",
            s(&opened),
        ],
        "wrong horse",
    );
    assert!(!output.status.success());
    assert!(!opened.exists());
}

#[test]
fn test_budget_from_environment() {
    let temp_dir = TempDir::new().unwrap();
    let params = temp_dir.path().join("params");

    // 1 KiB is below the smallest usable scrypt memory budget.
    let output = run_with_env(
        &["params", "-o", s(&params)],
        "",
        &[("SCRYPTCTR_MAXMEM", "1024")],
    );
    assert!(!output.status.success());
    assert!(!params.exists());
}
