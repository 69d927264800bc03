//! 游戏包解压
//!
//! 每个条目的目标路径都必须落在解压目录之内，
//! 绝对路径或含 `..` 的条目使整个包被拒绝。

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path};

use tracing::debug;
use zip::ZipArchive;

use crate::error::{LobbyError, LobbyResult};

/// 安全解压 zip 到 `dest`（`dest` 必须不存在或为空目录）
pub fn extract_zip(archive_path: &Path, dest: &Path) -> LobbyResult<usize> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| LobbyError::invalid_package(format!("无法读取 zip: {}", e)))?;

    fs::create_dir_all(dest)?;

    let mut extracted = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| LobbyError::invalid_package(format!("zip 条目损坏: {}", e)))?;

        let name = entry.name().to_string();
        if !is_relative_inside(Path::new(&name)) {
            return Err(LobbyError::invalid_package(format!("非法条目路径: {}", name)));
        }
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| LobbyError::invalid_package(format!("非法条目路径: {}", name)))?;
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        extracted += 1;
    }

    debug!("解压完成: {:?} ({} 个文件)", dest, extracted);
    Ok(extracted)
}

/// 路径是否为不越界的相对路径
fn is_relative_inside(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// 在内存中构造 zip
    pub(crate) fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_extract_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("package.zip");
        fs::write(
            &zip_path,
            build_zip(&[("game/manifest.json", b"{}"), ("game/lib/util.py", b"x = 1")]),
        )
        .unwrap();

        let dest = dir.path().join("out");
        assert_eq!(extract_zip(&zip_path, &dest).unwrap(), 2);
        assert_eq!(fs::read(dest.join("game/lib/util.py")).unwrap(), b"x = 1");
    }

    #[test]
    fn test_rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("package.zip");
        fs::write(&zip_path, build_zip(&[("../evil.txt", b"owned")])).unwrap();

        let dest = dir.path().join("out");
        assert!(matches!(
            extract_zip(&zip_path, &dest),
            Err(LobbyError::InvalidPackage(_))
        ));
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn test_rejects_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("package.zip");
        fs::write(&zip_path, build_zip(&[("/tmp/evil.txt", b"owned")])).unwrap();

        assert!(extract_zip(&zip_path, &dir.path().join("out")).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("package.zip");
        fs::write(&zip_path, b"definitely not a zip").unwrap();

        assert!(matches!(
            extract_zip(&zip_path, &dir.path().join("out")),
            Err(LobbyError::InvalidPackage(_))
        ));
    }
}
