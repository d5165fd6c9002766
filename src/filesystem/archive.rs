//! 压缩与解压缩
//!
//! 压缩把所选目录与文件递归写入 zip 流，每个条目之间响应取消
//! 信号；解压缩先把条目落到临时目录（压缩包本体经驱动读取，
//! 已具备随机访问能力），再按配置的并行度批量上传，条目路径
//! 经规范化前缀检查，越界条目直接丢弃。

use std::io;
use std::path::Path;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{FileSystem, FsPool};
use crate::error::FsError;
use crate::fsctx::UploadInfo;

fn zip_err(e: zip::result::ZipError) -> FsError {
    FsError::Internal(format!("压缩包处理失败: {}", e))
}

/// 规范化压缩包条目路径，越界或空路径返回 None
fn sanitize_entry_name(name: &str) -> Option<String> {
    let normalized = name.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for seg in normalized.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                // 上溯越过条目根即为路径穿越
                if parts.pop().is_none() {
                    return None;
                }
            }
            other => {
                // Windows 盘符前缀
                if other.len() == 2 && other.ends_with(':') {
                    return None;
                }
                parts.push(other);
            }
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

impl FileSystem {
    /// 把所选目录与文件打包为 zip，返回压缩包字节数
    pub async fn compress(
        &self,
        cancel: &CancellationToken,
        folder_ids: &[i64],
        file_ids: &[i64],
        dst: &Path,
    ) -> Result<u64, FsError> {
        let out = std::fs::File::create(dst).map_err(|e| FsError::Driver(e.into()))?;
        let mut zip = ZipWriter::new(out);
        let options: FileOptions =
            FileOptions::default().compression_method(CompressionMethod::Deflated);

        for &id in file_ids {
            let file = self.db.get_file_by_id(id)?;
            if let Err(e) = self.write_zip_entry(cancel, &mut zip, &file, "", options).await {
                let _ = std::fs::remove_file(dst);
                return Err(e);
            }
        }

        // 目录以显式栈递归，条目路径带上目录前缀
        let mut stack: Vec<(i64, String)> = Vec::new();
        for &id in folder_ids {
            let folder = self.db.get_folder_by_id(id)?;
            stack.push((folder.id, format!("{}/", folder.name)));
        }
        while let Some((folder_id, prefix)) = stack.pop() {
            if cancel.is_cancelled() {
                let _ = std::fs::remove_file(dst);
                return Err(FsError::Canceled);
            }
            zip.add_directory(prefix.trim_end_matches('/'), options)
                .map_err(zip_err)?;

            let (folders, files) = self.list(folder_id)?;
            for file in &files {
                if let Err(e) = self
                    .write_zip_entry(cancel, &mut zip, file, &prefix, options)
                    .await
                {
                    let _ = std::fs::remove_file(dst);
                    return Err(e);
                }
            }
            for sub in folders {
                stack.push((sub.id, format!("{}{}/", prefix, sub.name)));
            }
        }

        zip.finish().map_err(zip_err)?;
        let size = std::fs::metadata(dst)
            .map_err(|e| FsError::Driver(e.into()))?
            .len();
        info!(dst = %dst.display(), size, "压缩完成");
        Ok(size)
    }

    async fn write_zip_entry(
        &self,
        cancel: &CancellationToken,
        zip: &mut ZipWriter<std::fs::File>,
        file: &crate::models::File,
        prefix: &str,
        options: FileOptions,
    ) -> Result<(), FsError> {
        if cancel.is_cancelled() {
            return Err(FsError::Canceled);
        }
        if file.is_placeholder() {
            warn!(name = %file.name, "跳过未完成上传的占位文件");
            return Ok(());
        }
        zip.start_file(format!("{}{}", prefix, file.name), options)
            .map_err(zip_err)?;
        let mut reader = self.driver.get(&file.source_name).await?;
        io::copy(&mut reader, zip).map_err(|e| FsError::Driver(e.into()))?;
        Ok(())
    }

    /// 解压缩到指定虚拟目录
    ///
    /// 条目先落临时目录，再经实例池按 max_parallel_transfer 的
    /// 并行度上传；部分条目失败以部分失败上报
    pub async fn decompress(
        &mut self,
        pool: &FsPool,
        cancel: &CancellationToken,
        file_id: i64,
        dst: &str,
    ) -> Result<(), FsError> {
        let file = self.db.get_file_by_id(file_id)?;
        let reader = self.driver.get(&file.source_name).await?;
        let mut archive = zip::ZipArchive::new(reader).map_err(zip_err)?;

        std::fs::create_dir_all(&self.env.upload.temp_path)
            .map_err(|e| FsError::Driver(e.into()))?;
        let temp_root = tempfile::tempdir_in(&self.env.upload.temp_path)
            .map_err(|e| FsError::Driver(e.into()))?;

        // 条目名、临时文件与目标虚拟目录
        let mut jobs: Vec<(std::path::PathBuf, String, String)> = Vec::new();
        for i in 0..archive.len() {
            if cancel.is_cancelled() {
                return Err(FsError::Canceled);
            }
            let mut entry = archive.by_index(i).map_err(zip_err)?;
            let Some(rel) = sanitize_entry_name(entry.name()) else {
                warn!(entry = %entry.name(), "丢弃越界的压缩包条目");
                continue;
            };

            if entry.is_dir() {
                self.create_directory(&format!("{}/{}", dst.trim_end_matches('/'), rel))?;
                continue;
            }

            let (dir, name) = match rel.rsplit_once('/') {
                Some((d, n)) => (format!("{}/{}", dst.trim_end_matches('/'), d), n.to_string()),
                None => (dst.to_string(), rel.clone()),
            };
            let temp_path = temp_root.path().join(i.to_string());
            let mut temp = std::fs::File::create(&temp_path)
                .map_err(|e| FsError::Driver(e.into()))?;
            io::copy(&mut entry, &mut temp).map_err(|e| FsError::Driver(e.into()))?;
            jobs.push((temp_path, dir, name));
        }

        let total = jobs.len();
        let user_id = self.user.id;
        let parallel = self.env.upload.max_parallel_transfer.max(1);
        let failed = futures::stream::iter(jobs)
            .map(|(path, virtual_path, file_name)| async move {
                let result = async {
                    let mut fs = pool.checkout(user_id)?;
                    let info = UploadInfo {
                        file_name: file_name.clone(),
                        virtual_path,
                        ..Default::default()
                    };
                    let res = fs.upload_from_path(cancel, &path, info).await;
                    pool.recycle(fs).await;
                    res.map(|_| ())
                }
                .await;
                if let Err(e) = &result {
                    warn!(name = %file_name, "解压缩条目上传失败: {}", e);
                }
                result
            })
            .buffer_unordered(parallel)
            .filter(|r| std::future::ready(r.is_err()))
            .count()
            .await;

        if failed > 0 {
            return Err(FsError::NotFullySuccess { failed, total });
        }
        info!(file = %file.name, entries = total, "解压缩完成");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::tests::test_fixture;
    use crate::fsctx::FileStream;
    use std::io::{Cursor, Write};

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options: FileOptions = FileOptions::default();
        for (name, data) in entries {
            if name.ends_with('/') {
                zip.add_directory(name.trim_end_matches('/'), options).unwrap();
            } else {
                zip.start_file(*name, options).unwrap();
                zip.write_all(data).unwrap();
            }
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_sanitize_entry_name() {
        assert_eq!(sanitize_entry_name("a/b.txt"), Some("a/b.txt".into()));
        assert_eq!(sanitize_entry_name("a/./b.txt"), Some("a/b.txt".into()));
        assert_eq!(sanitize_entry_name("a/../b.txt"), Some("b.txt".into()));
        assert_eq!(sanitize_entry_name("../evil.txt"), None);
        assert_eq!(sanitize_entry_name("a/../../evil.txt"), None);
        assert_eq!(sanitize_entry_name("C:/evil.txt"), None);
        assert_eq!(sanitize_entry_name("/"), None);
        assert_eq!(sanitize_entry_name("a\\b.txt"), Some("a/b.txt".into()));
    }

    async fn upload_archive(
        fs: &mut FileSystem,
        data: Vec<u8>,
        name: &str,
    ) -> i64 {
        let cancel = CancellationToken::new();
        let target = fs
            .upload_from_stream(
                &cancel,
                FileStream::from_seekable(
                    Cursor::new(data.clone()),
                    UploadInfo {
                        size: data.len() as u64,
                        file_name: name.to_string(),
                        virtual_path: "/".into(),
                        ..Default::default()
                    },
                ),
            )
            .await
            .unwrap();
        target.model.unwrap().id
    }

    #[tokio::test]
    async fn test_decompress_into_virtual_tree() {
        let (_dir, db, pool, uid) = test_fixture();
        let mut fs = pool.checkout(uid).unwrap();
        let cancel = CancellationToken::new();

        let data = build_zip(&[
            ("docs/", b""),
            ("docs/a.txt", b"alpha"),
            ("b.txt", b"beta"),
        ]);
        let archive_id = upload_archive(&mut fs, data, "pack.zip").await;

        fs.decompress(&pool, &cancel, archive_id, "/unpacked")
            .await
            .unwrap();

        let root = fs.root_folder().unwrap();
        let (folders, _) = fs.list(root.id).unwrap();
        let unpacked = folders.iter().find(|f| f.name == "unpacked").unwrap();
        let (sub, files) = fs.list(unpacked.id).unwrap();
        assert_eq!(files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(), ["b.txt"]);
        let docs = sub.iter().find(|f| f.name == "docs").unwrap();
        let (_, docs_files) = fs.list(docs.id).unwrap();
        assert_eq!(docs_files[0].name, "a.txt");
        assert_eq!(std::fs::read(&docs_files[0].source_name).unwrap(), b"alpha");

        // 配额：压缩包 + 两个解压产物
        let expected = db.get_file_by_id(archive_id).unwrap().size + 5 + 4;
        assert_eq!(db.get_user_by_id(uid).unwrap().storage, expected);
    }

    #[tokio::test]
    async fn test_decompress_drops_traversal_entries() {
        let (_dir, db, pool, uid) = test_fixture();
        let mut fs = pool.checkout(uid).unwrap();
        let cancel = CancellationToken::new();

        let data = build_zip(&[("../evil.txt", b"boom"), ("ok.txt", b"fine")]);
        let archive_id = upload_archive(&mut fs, data, "trap.zip").await;

        fs.decompress(&pool, &cancel, archive_id, "/out")
            .await
            .unwrap();

        // 越界条目被丢弃，仅合法条目落库
        let root = fs.root_folder().unwrap();
        let (folders, root_files) = fs.list(root.id).unwrap();
        assert!(root_files.iter().all(|f| f.name != "evil.txt"));
        let out = folders.iter().find(|f| f.name == "out").unwrap();
        let (_, out_files) = fs.list(out.id).unwrap();
        assert_eq!(out_files.len(), 1);
        assert_eq!(out_files[0].name, "ok.txt");
        drop(db);
    }

    #[tokio::test]
    async fn test_compress_roundtrip() {
        let (dir, _db, pool, uid) = test_fixture();
        let mut fs = pool.checkout(uid).unwrap();
        let cancel = CancellationToken::new();

        let id_a = upload_archive(&mut fs, b"content-a".to_vec(), "a.txt").await;
        let data = build_zip(&[("inner.txt", b"inner")]);
        let _ = upload_archive(&mut fs, data, "skipme.zip").await;

        let dst = dir.path().join("out.zip");
        let size = fs.compress(&cancel, &[], &[id_a], &dst).await.unwrap();
        assert!(size > 0);

        let mut archive =
            zip::ZipArchive::new(std::fs::File::open(&dst).unwrap()).unwrap();
        let mut entry = archive.by_name("a.txt").unwrap();
        let mut content = String::new();
        std::io::Read::read_to_string(&mut entry, &mut content).unwrap();
        assert_eq!(content, "content-a");
    }

    #[tokio::test]
    async fn test_compress_canceled_removes_partial_output() {
        let (dir, _db, pool, uid) = test_fixture();
        let mut fs = pool.checkout(uid).unwrap();

        let id = upload_archive(&mut fs, b"x".to_vec(), "x.txt").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let dst = dir.path().join("canceled.zip");
        let err = fs.compress(&cancel, &[], &[id], &dst).await.unwrap_err();
        assert!(matches!(err, FsError::Canceled));
        assert!(!dst.exists());
    }

    #[tokio::test]
    async fn test_compress_folder_recursion() {
        let (dir, _db, pool, uid) = test_fixture();
        let mut fs = pool.checkout(uid).unwrap();
        let cancel = CancellationToken::new();

        // /photos/2026/pic.bin
        let data = b"pixels".to_vec();
        let target = fs
            .upload_from_stream(
                &cancel,
                FileStream::from_seekable(
                    Cursor::new(data.clone()),
                    UploadInfo {
                        size: data.len() as u64,
                        file_name: "pic.bin".into(),
                        virtual_path: "/photos/2026".into(),
                        ..Default::default()
                    },
                ),
            )
            .await
            .unwrap();
        drop(target);

        let root = fs.root_folder().unwrap();
        let (folders, _) = fs.list(root.id).unwrap();
        let photos = folders.iter().find(|f| f.name == "photos").unwrap();

        let dst = dir.path().join("tree.zip");
        fs.compress(&cancel, &[photos.id], &[], &dst).await.unwrap();

        let mut archive =
            zip::ZipArchive::new(std::fs::File::open(&dst).unwrap()).unwrap();
        assert!(archive.by_name("photos/2026/pic.bin").is_ok());
    }
}
