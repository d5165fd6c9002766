//! 本机磁盘驱动

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{ContentResponse, Driver, DriverEnv, Object, UploadCredential, UploadSession};
use crate::auth::HmacAuth;
use crate::cache::{CacheStore, DOWNLOAD_SESSION_PREFIX};
use crate::error::DriverError;
use crate::fsctx::{FileStream, ReadSeek, UploadInfo, WriteMode};
use crate::models::{rand_string, File, Policy};

const DIR_PERM_HINT: &str = "创建目录失败";

pub struct LocalDriver {
    policy: Policy,
    auth: HmacAuth,
    cache: Arc<CacheStore>,
    /// 缩略图文件的物理后缀
    thumb_suffix: String,
}

impl LocalDriver {
    pub fn new(policy: Policy, env: &DriverEnv) -> Self {
        Self {
            policy,
            auth: HmacAuth::new(env.site_secret.as_bytes().to_vec()),
            cache: env.cache.clone(),
            thumb_suffix: env.upload.thumb_suffix.clone(),
        }
    }

    fn thumb_path(&self, path: &str) -> String {
        format!("{}{}", path, self.thumb_suffix)
    }
}

#[async_trait]
impl Driver for LocalDriver {
    async fn put(&self, file: &mut FileStream) -> Result<(), DriverError> {
        let info = file.info.clone();
        let dst = PathBuf::from(&info.save_path);

        // 非覆盖模式下不允许物理同名文件存在
        if !info.mode.contains(WriteMode::OVERWRITE) && dst.exists() {
            warn!(path = %dst.display(), "物理同名文件已存在");
            return Err(DriverError::PhysicalFileExisted(
                dst.display().to_string(),
            ));
        }

        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| io::Error::new(e.kind(), format!("{}: {}", DIR_PERM_HINT, e)))?;
        }

        let append = info.mode.contains(WriteMode::APPEND);
        let mut out = open_dst(&dst, append)?;

        if append {
            let actual = out.metadata()?.len();
            if actual < info.append_start {
                // 前序分片缺失，只能由上层重建会话
                return Err(DriverError::AppendOffsetMismatch {
                    expected: info.append_start,
                    actual,
                });
            }
            if actual > info.append_start {
                // 分片重传，截断到分片起点后重写
                debug!(path = %dst.display(), offset = info.append_start, "截断文件以重写分片");
                drop(out);
                truncate_to(&dst, info.append_start)?;
                out = open_dst(&dst, append)?;
            }
        }

        let mut buf = [0u8; 32 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
        }
        out.flush()?;
        Ok(())
    }

    async fn delete(&self, files: &[String]) -> Result<Vec<String>, DriverError> {
        let mut failed = Vec::new();
        for path in files {
            let p = Path::new(path);
            if p.exists() {
                if let Err(e) = std::fs::remove_file(p) {
                    warn!(path = %path, "删除物理文件失败: {}", e);
                    failed.push(path.clone());
                }
            }
            // 缩略图随主文件一并清理，不存在时忽略
            let _ = std::fs::remove_file(self.thumb_path(path));
        }
        Ok(failed)
    }

    async fn get(&self, path: &str) -> Result<Box<dyn ReadSeek>, DriverError> {
        let file = std::fs::File::open(path)?;
        Ok(Box::new(file))
    }

    async fn thumb(&self, path: &str) -> Result<ContentResponse, DriverError> {
        let file = self.get(&self.thumb_path(path)).await?;
        Ok(ContentResponse::Content(file))
    }

    async fn source(
        &self,
        file: &File,
        base_url: &str,
        ttl: i64,
        is_download: bool,
    ) -> Result<String, DriverError> {
        // 策略配置了 CDN 时替换基地址
        let base = if self.policy.base_url.is_empty() {
            base_url
        } else {
            &self.policy.base_url
        };

        let signed = if is_download {
            // 一次性下载会话，内容由会话接口回源
            let session_id = rand_string(16);
            self.cache.set(
                &format!("{}{}", DOWNLOAD_SESSION_PREFIX, session_id),
                file,
                ttl,
            );
            self.auth
                .sign_uri(&format!("/api/v3/file/download/{}", session_id), ttl)
        } else {
            self.auth.sign_uri(
                &format!("/api/v3/file/get/{}/{}", file.id, urlencoding::encode(&file.name)),
                ttl,
            )
        };

        Ok(format!("{}{}", base.trim_end_matches('/'), signed))
    }

    async fn token(
        &self,
        session: &UploadSession,
        _info: &UploadInfo,
    ) -> Result<UploadCredential, DriverError> {
        // 占位物理文件已存在说明会话冲突
        if Path::new(&session.save_path).exists() {
            return Err(DriverError::PlaceholderExisted);
        }
        Ok(UploadCredential {
            session_id: session.key.clone(),
            chunk_size: self.policy.options.chunk_size,
            ..Default::default()
        })
    }

    async fn cancel_token(&self, _session: &UploadSession) -> Result<(), DriverError> {
        Ok(())
    }

    async fn list(&self, path: &str, recursive: bool) -> Result<Vec<Object>, DriverError> {
        let root = Path::new(path);
        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut objects = Vec::new();

        for entry in WalkDir::new(root).max_depth(max_depth).into_iter() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("列举目录失败: {}", e);
                    continue;
                }
            };
            if entry.path() == root {
                continue;
            }
            let meta = entry.metadata().map_err(|e| {
                io::Error::new(io::ErrorKind::Other, format!("读取文件信息失败: {}", e))
            })?;
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let last_modify = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64);

            objects.push(Object {
                name: entry.file_name().to_string_lossy().to_string(),
                relative_path: rel,
                source: entry.path().to_string_lossy().to_string(),
                size: meta.len(),
                is_dir: meta.is_dir(),
                last_modify,
            });
        }
        Ok(objects)
    }
}

fn open_dst(dst: &Path, append: bool) -> io::Result<std::fs::File> {
    let mut opts = OpenOptions::new();
    opts.create(true).read(true).write(true);
    if append {
        opts.append(true);
    } else {
        opts.truncate(true);
    }
    opts.open(dst)
}

fn truncate_to(path: &Path, size: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(size)
}
