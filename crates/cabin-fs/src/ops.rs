//! Filesystem operation handlers.
//!
//! Each method corresponds to one FS operation on the control channel.
//! All paths go through [`crate::path::resolve`] before reaching the OS,
//! so nothing here can touch files outside the workspace root. Results
//! are JSON values ready to be placed in a response envelope's `data`
//! field; `Value::Null` means "success with no data".

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio::fs;

use cabin_core::{AgentError, Result};

use crate::path;

/// A workspace-confined view of the filesystem.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, user_path: &str) -> PathBuf {
        path::resolve(&self.root, user_path)
    }

    /// Read a file as UTF-8 text. Returns `{content}`.
    pub async fn read_file(&self, user_path: &str, encoding: Option<&str>) -> Result<Value> {
        check_encoding(encoding)?;
        let abs = self.resolve(user_path);
        let content = fs::read_to_string(&abs)
            .await
            .map_err(|e| AgentError::filesystem(format!("failed to read '{}': {}", user_path, e)))?;
        Ok(json!({ "content": content }))
    }

    /// Write UTF-8 text to a file, replacing any existing contents.
    pub async fn write_file(
        &self,
        user_path: &str,
        content: Option<&str>,
        encoding: Option<&str>,
    ) -> Result<Value> {
        check_encoding(encoding)?;
        let content = content
            .ok_or_else(|| AgentError::filesystem("writeFile requires a 'content' field"))?;
        let abs = self.resolve(user_path);
        fs::write(&abs, content)
            .await
            .map_err(|e| AgentError::filesystem(format!("failed to write '{}': {}", user_path, e)))?;
        Ok(Value::Null)
    }

    /// Remove a file, or a directory when `recursive` is set.
    pub async fn remove(&self, user_path: &str, recursive: bool) -> Result<Value> {
        let abs = self.resolve(user_path);
        let meta = fs::metadata(&abs)
            .await
            .map_err(|e| AgentError::filesystem(format!("failed to stat '{}': {}", user_path, e)))?;

        let result = if meta.is_dir() {
            if recursive {
                fs::remove_dir_all(&abs).await
            } else {
                fs::remove_dir(&abs).await
            }
        } else {
            fs::remove_file(&abs).await
        };

        result
            .map_err(|e| AgentError::filesystem(format!("failed to remove '{}': {}", user_path, e)))?;
        Ok(Value::Null)
    }

    /// List a directory. Returns `{entries: [{name, isFile, isDirectory}]}`
    /// sorted by name.
    pub async fn read_dir(&self, user_path: &str) -> Result<Value> {
        let abs = self.resolve(user_path);
        let mut reader = fs::read_dir(&abs)
            .await
            .map_err(|e| AgentError::filesystem(format!("failed to read '{}': {}", user_path, e)))?;

        let mut entries: Vec<(String, Value)> = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| AgentError::filesystem(format!("failed to read '{}': {}", user_path, e)))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().await.map_err(|e| {
                AgentError::filesystem(format!("failed to stat '{}/{}': {}", user_path, name, e))
            })?;
            let value = json!({
                "name": name,
                "isFile": file_type.is_file(),
                "isDirectory": file_type.is_dir(),
            });
            entries.push((name, value));
        }

        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let entries: Vec<Value> = entries.into_iter().map(|(_, v)| v).collect();
        Ok(json!({ "entries": entries }))
    }

    /// Create a directory; `recursive` creates missing parents and makes
    /// the operation idempotent.
    pub async fn make_dir(&self, user_path: &str, recursive: bool) -> Result<Value> {
        let abs = self.resolve(user_path);
        let result = if recursive {
            fs::create_dir_all(&abs).await
        } else {
            fs::create_dir(&abs).await
        };
        result
            .map_err(|e| AgentError::filesystem(format!("failed to mkdir '{}': {}", user_path, e)))?;
        Ok(Value::Null)
    }

    /// Stat a path. Returns `{size, isFile, isDirectory, mtimeMs}`.
    pub async fn stat(&self, user_path: &str) -> Result<Value> {
        let abs = self.resolve(user_path);
        let meta = fs::metadata(&abs)
            .await
            .map_err(|e| AgentError::filesystem(format!("failed to stat '{}': {}", user_path, e)))?;

        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Ok(json!({
            "size": meta.len(),
            "isFile": meta.is_file(),
            "isDirectory": meta.is_dir(),
            "mtimeMs": mtime_ms,
        }))
    }

    /// Bulk-write a nested tree of file contents under `user_path`.
    ///
    /// Tree shape: a JSON object whose string values are file contents and
    /// whose object values are subdirectories. Permissions and timestamps
    /// are not part of the tree and are not applied.
    pub async fn mount(&self, user_path: Option<&str>, content: Option<&Value>) -> Result<Value> {
        let tree = content
            .ok_or_else(|| AgentError::filesystem("mount requires a 'content' field"))?
            .as_object()
            .ok_or_else(|| AgentError::filesystem("mount content must be an object"))?;

        let base = self.resolve(user_path.unwrap_or(""));
        fs::create_dir_all(&base).await.map_err(|e| {
            AgentError::filesystem(format!("failed to create mount root: {}", e))
        })?;

        write_tree(base, tree).await?;
        Ok(Value::Null)
    }
}

/// Recursively materialise one level of a mount tree.
fn write_tree(base: PathBuf, tree: &Map<String, Value>) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        for (name, node) in tree {
            if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
                return Err(AgentError::filesystem(format!(
                    "invalid mount entry name '{}'",
                    name
                )));
            }

            let target = base.join(name);
            match node {
                Value::String(contents) => {
                    fs::write(&target, contents).await.map_err(|e| {
                        AgentError::filesystem(format!("failed to write '{}': {}", name, e))
                    })?;
                }
                Value::Object(children) => {
                    fs::create_dir_all(&target).await.map_err(|e| {
                        AgentError::filesystem(format!("failed to create '{}': {}", name, e))
                    })?;
                    write_tree(target, children).await?;
                }
                _ => {
                    return Err(AgentError::filesystem(format!(
                        "mount entry '{}' must be a string or an object",
                        name
                    )));
                }
            }
        }
        Ok(())
    })
}

fn check_encoding(encoding: Option<&str>) -> Result<()> {
    match encoding {
        None | Some("utf8") | Some("utf-8") => Ok(()),
        Some(other) => Err(AgentError::filesystem(format!(
            "unsupported encoding '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().expect("tempdir");
        let ws = Workspace::new(dir.path());
        (dir, ws)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_dir, ws) = workspace();
        ws.write_file("hello.txt", Some("hi there"), None)
            .await
            .expect("write");
        let data = ws.read_file("hello.txt", Some("utf8")).await.expect("read");
        assert_eq!(data["content"], "hi there");
    }

    #[tokio::test]
    async fn write_without_content_fails_with_fs_code() {
        let (_dir, ws) = workspace();
        let err = ws
            .write_file("hello.txt", None, None)
            .await
            .expect_err("missing content");
        assert_eq!(err.code(), "FILESYSTEM_OPERATION_FAILED");
    }

    #[tokio::test]
    async fn unsupported_encoding_is_rejected() {
        let (_dir, ws) = workspace();
        let err = ws
            .read_file("hello.txt", Some("base64"))
            .await
            .expect_err("unsupported encoding");
        assert_eq!(err.code(), "FILESYSTEM_OPERATION_FAILED");
        assert!(err.to_string().contains("base64"));
    }

    #[tokio::test]
    async fn escaping_read_stays_inside_workspace() {
        let (_dir, ws) = workspace();
        // Nothing at <root>/etc/passwd, so the confined read fails with a
        // filesystem error rather than leaking the host file.
        let err = ws
            .read_file("../etc/passwd", None)
            .await
            .expect_err("no such file inside workspace");
        assert_eq!(err.code(), "FILESYSTEM_OPERATION_FAILED");

        // Once the rewritten path exists, the same request succeeds.
        ws.make_dir("etc", true).await.expect("mkdir");
        ws.write_file("etc/passwd", Some("decoy"), None)
            .await
            .expect("write decoy");
        let data = ws.read_file("../etc/passwd", None).await.expect("read");
        assert_eq!(data["content"], "decoy");
    }

    #[tokio::test]
    async fn recursive_mkdir_is_idempotent() {
        let (_dir, ws) = workspace();
        ws.make_dir("a/b/c", true).await.expect("first mkdir");
        ws.make_dir("a/b/c", true).await.expect("second mkdir");
    }

    #[tokio::test]
    async fn non_recursive_mkdir_requires_parent() {
        let (_dir, ws) = workspace();
        let err = ws.make_dir("a/b/c", false).await.expect_err("no parent");
        assert_eq!(err.code(), "FILESYSTEM_OPERATION_FAILED");
    }

    #[tokio::test]
    async fn readdir_missing_path_fails() {
        let (_dir, ws) = workspace();
        let err = ws.read_dir("nope").await.expect_err("missing dir");
        assert_eq!(err.code(), "FILESYSTEM_OPERATION_FAILED");
    }

    #[tokio::test]
    async fn readdir_reports_entry_kinds_sorted() {
        let (_dir, ws) = workspace();
        ws.make_dir("sub", false).await.expect("mkdir");
        ws.write_file("b.txt", Some("b"), None).await.expect("write");
        ws.write_file("a.txt", Some("a"), None).await.expect("write");

        let data = ws.read_dir("").await.expect("readdir");
        let entries = data["entries"].as_array().expect("entries array");
        let names: Vec<&str> = entries
            .iter()
            .map(|e| e["name"].as_str().expect("name"))
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(entries[2]["isDirectory"], true);
        assert_eq!(entries[0]["isFile"], true);
    }

    #[tokio::test]
    async fn stat_reports_size_and_kind() {
        let (_dir, ws) = workspace();
        ws.write_file("f.txt", Some("12345"), None).await.expect("write");
        let data = ws.stat("f.txt").await.expect("stat");
        assert_eq!(data["size"], 5);
        assert_eq!(data["isFile"], true);
        assert_eq!(data["isDirectory"], false);

        let err = ws.stat("missing").await.expect_err("missing path");
        assert_eq!(err.code(), "FILESYSTEM_OPERATION_FAILED");
    }

    #[tokio::test]
    async fn remove_file_and_recursive_dir() {
        let (_dir, ws) = workspace();
        ws.write_file("f.txt", Some("x"), None).await.expect("write");
        ws.remove("f.txt", false).await.expect("rm file");

        ws.make_dir("d/e", true).await.expect("mkdir");
        ws.write_file("d/e/f.txt", Some("x"), None).await.expect("write");
        let err = ws.remove("d", false).await.expect_err("non-empty dir");
        assert_eq!(err.code(), "FILESYSTEM_OPERATION_FAILED");
        ws.remove("d", true).await.expect("rm -r");
        assert!(ws.stat("d").await.is_err());
    }

    #[tokio::test]
    async fn mount_materialises_tree_and_readdir_reflects_keys() {
        let (_dir, ws) = workspace();
        let tree = json!({
            "src": {
                "main.rs": "fn main() {}",
                "lib.rs": "pub fn f() {}",
            },
            "README.md": "# demo",
        });
        ws.mount(None, Some(&tree)).await.expect("mount");

        let data = ws.read_dir("").await.expect("readdir");
        let names: Vec<&str> = data["entries"]
            .as_array()
            .expect("entries")
            .iter()
            .map(|e| e["name"].as_str().expect("name"))
            .collect();
        assert_eq!(names, vec!["README.md", "src"]);

        let main = ws.read_file("src/main.rs", None).await.expect("read");
        assert_eq!(main["content"], "fn main() {}");
    }

    #[tokio::test]
    async fn mount_rejects_traversal_entry_names() {
        let (_dir, ws) = workspace();
        let tree = json!({ "..": { "evil.txt": "x" } });
        let err = ws.mount(None, Some(&tree)).await.expect_err("bad name");
        assert_eq!(err.code(), "FILESYSTEM_OPERATION_FAILED");
    }

    #[tokio::test]
    async fn mount_without_content_fails() {
        let (_dir, ws) = workspace();
        let err = ws.mount(None, None).await.expect_err("no content");
        assert_eq!(err.code(), "FILESYSTEM_OPERATION_FAILED");
    }
}
