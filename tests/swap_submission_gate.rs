use std::fs;
use std::path::{Path, PathBuf};

// Swap submission is confined to the execution gateway; every other stage
// reaches the chain only through reads or treasury-specific calls.
const ALLOWED_SWAP_SUBMITTERS: &[&str] = &[
    "src/engine/gateway.rs",
    "src/adapters/evm.rs",
    "src/adapters/traits.rs",
];

fn collect_rust_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            out.push(path);
        }
    }
}

#[test]
fn swap_submission_is_limited_to_the_gateway() {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let src_root = repo_root.join("src");
    let mut files = Vec::new();
    collect_rust_files(&src_root, &mut files);

    let mut offenders = Vec::new();
    for file in files {
        let rel = file
            .strip_prefix(repo_root)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        if ALLOWED_SWAP_SUBMITTERS.iter().any(|allowed| *allowed == rel) {
            continue;
        }
        let content = fs::read_to_string(&file).unwrap_or_default();
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.contains(".submit_swap(") {
                offenders.push(format!("{rel}:{}: {trimmed}", idx + 1));
            }
        }
    }

    assert!(
        offenders.is_empty(),
        "swap submission detected outside the gateway:\n{}",
        offenders.join("\n")
    );
}
