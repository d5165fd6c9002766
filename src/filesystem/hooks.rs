//! 上传钩子管线
//!
//! 上传过程中的校验、记录落库与收尾动作以钩子形式挂在各生命
//! 周期事件上，按注册顺序执行，任一钩子失败即中断后续钩子。

use std::collections::hash_map::Entry;

use serde::Serialize;
use tracing::{debug, warn};

use super::FileSystem;
use crate::cache::UPLOAD_SESSION_PREFIX;
use crate::error::FsError;
use crate::fsctx::UploadInfo;
use crate::models::File;

/// 钩子挂载的生命周期事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// 物理写入前
    BeforeUpload,
    /// 物理写入成功后
    AfterUpload,
    /// 客户端取消后
    AfterUploadCanceled,
    /// 物理写入失败后
    AfterUploadFailed,
    /// 写入成功但后置校验失败后
    AfterValidateFailed,
}

/// 一次上传操作在钩子间传递的状态
#[derive(Debug, Default)]
pub struct UploadTarget {
    pub info: UploadInfo,
    /// 本次上传产生的文件记录
    pub model: Option<File>,
    /// 更新上传时被覆盖的原文件记录
    pub origin: Option<File>,
}

/// 从机上传完成后回调主机的载荷
#[derive(Debug, Serialize)]
struct SlaveUploadCallback {
    name: String,
    source_name: String,
    size: u64,
    pic_info: String,
}

/// 上传钩子
pub enum Hook {
    /// 校验文件名、大小与扩展名
    ValidateFile,
    /// 校验剩余容量
    ValidateCapacity,
    /// 按新旧大小差值校验容量（更新上传）
    ValidateCapacityDiff,
    /// 创建目录、查重并落库文件记录
    GenericAfterUpload,
    /// 分片写入成功，把占位文件大小推进到新偏移
    ChunkUploaded,
    /// 分片写入失败，把占位文件大小回退到分片起点
    ChunkUploadFailed,
    /// 占位文件转正
    PopPlaceholderToFile { pic_info: String },
    /// 删除缓存中的上传会话
    DeleteUploadSession { key: String },
    /// 删除物理临时文件
    DeleteTempFile,
    /// 清零声明大小（不预扣容量的占位上传）
    ClearFileSize,
    /// 后台探测图片尺寸并回写探针信息
    GenerateThumb,
    /// 从机写入完成后回调主机
    SlaveAfterUpload { callback_url: String },
}

impl Hook {
    pub async fn run(&self, fs: &FileSystem, target: &mut UploadTarget) -> Result<(), FsError> {
        match self {
            Hook::ValidateFile => {
                if !fs.validate_legal_name(&target.info.file_name) {
                    return Err(FsError::IllegalObjectName(target.info.file_name.clone()));
                }
                if !fs.validate_file_size(target.info.size) {
                    return Err(FsError::FileSizeTooBig);
                }
                if !fs.validate_extension(&target.info.file_name) {
                    return Err(FsError::ExtensionNotAllowed);
                }
                Ok(())
            }

            Hook::ValidateCapacity => fs.validate_capacity(target.info.size),

            Hook::ValidateCapacityDiff => {
                if let Some(origin) = &target.origin {
                    if target.info.size > origin.size {
                        return fs.validate_capacity(target.info.size - origin.size);
                    }
                }
                Ok(())
            }

            Hook::GenericAfterUpload => {
                let folder = fs.create_directory(&target.info.virtual_path)?;

                if let Some(existing) = fs.child_file(&folder, &target.info.file_name)? {
                    if let Some(sid) = &existing.upload_session_id {
                        // 同一会话的重复回调直接复用占位记录
                        if target.info.upload_session_id.as_deref() == Some(sid.as_str()) {
                            target.model = Some(existing);
                            return Ok(());
                        }
                        return Err(FsError::UploadSessionExisted);
                    }
                    return Err(FsError::FileExisted);
                }

                let file = File {
                    id: 0,
                    name: target.info.file_name.clone(),
                    source_name: target.info.save_path.clone(),
                    user_id: fs.user.id,
                    size: target.info.size,
                    pic_info: String::new(),
                    folder_id: folder.id,
                    policy_id: fs.policy.id,
                    upload_session_id: target.info.upload_session_id.clone(),
                    metadata: String::new(),
                };
                let id = fs.db.create_file(&file)?;
                target.model = Some(fs.db.get_file_by_id(id)?);
                Ok(())
            }

            Hook::ChunkUploaded => {
                let Some(model) = &target.model else {
                    return Err(FsError::ObjectNotExist);
                };
                fs.db
                    .update_file_size(model.id, target.info.append_start + target.info.size)
            }

            Hook::ChunkUploadFailed => {
                let Some(model) = &target.model else {
                    return Err(FsError::ObjectNotExist);
                };
                fs.db.update_file_size(model.id, target.info.append_start)
            }

            Hook::PopPlaceholderToFile { pic_info } => {
                let Some(model) = &target.model else {
                    return Err(FsError::ObjectNotExist);
                };
                let mut pic = pic_info.clone();
                if pic.is_empty() && fs.policy.is_thumb_exist(&model.name) {
                    // 存储端可出图但未上报尺寸，写入哨兵值
                    pic = "1,1".to_string();
                }
                fs.db.pop_chunk_to_file(model.id, &pic)
            }

            Hook::DeleteUploadSession { key } => {
                fs.env
                    .cache
                    .delete(&format!("{}{}", UPLOAD_SESSION_PREFIX, key));
                Ok(())
            }

            Hook::DeleteTempFile => {
                let failed = fs.driver.delete(&[target.info.save_path.clone()]).await?;
                if !failed.is_empty() {
                    warn!(path = %target.info.save_path, "临时文件删除失败");
                }
                Ok(())
            }

            Hook::ClearFileSize => {
                target.info.size = 0;
                Ok(())
            }

            Hook::GenerateThumb => {
                if !fs.policy.is_thumb_generate_needed() {
                    return Ok(());
                }
                let Some(model) = &target.model else {
                    return Ok(());
                };
                let db = fs.db.clone();
                let file_id = model.id;
                let path = model.source_name.clone();
                // 持有归还锁直到探测结束，实例归还时等待该任务
                let guard = fs.recycle_lock.clone().lock_owned().await;
                tokio::spawn(async move {
                    let _guard = guard;
                    let result = tokio::task::spawn_blocking(move || probe_image_file(&path)).await;
                    if let Ok(Some((w, h))) = result {
                        debug!(file_id, width = w, height = h, "图片探针完成");
                        if let Err(e) = db.set_pic_info(file_id, &format!("{},{}", w, h)) {
                            warn!(file_id, "写入图片探针信息失败: {}", e);
                        }
                    }
                });
                Ok(())
            }

            Hook::SlaveAfterUpload { callback_url } => {
                let pic_info = probe_image_file(&target.info.save_path)
                    .map(|(w, h)| format!("{},{}", w, h))
                    .unwrap_or_default();
                let body = SlaveUploadCallback {
                    name: target.info.file_name.clone(),
                    source_name: target.info.save_path.clone(),
                    size: target.info.size,
                    pic_info,
                };
                let resp = reqwest::Client::new()
                    .post(callback_url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| FsError::Internal(format!("回调主机失败: {}", e)))?;
                if !resp.status().is_success() {
                    return Err(FsError::Internal(format!(
                        "主机回调返回异常状态: {}",
                        resp.status()
                    )));
                }
                Ok(())
            }
        }
    }
}

impl FileSystem {
    /// 在指定事件上追加钩子
    pub fn use_hook(&mut self, event: HookEvent, hook: Hook) {
        self.hooks.entry(event).or_default().push(hook);
    }

    /// 清空钩子；event 为 None 时清空全部事件
    pub fn clean_hooks(&mut self, event: Option<HookEvent>) {
        match event {
            Some(e) => {
                if let Entry::Occupied(o) = self.hooks.entry(e) {
                    o.remove();
                }
            }
            None => self.hooks.clear(),
        }
    }

    /// 按注册顺序执行事件上的钩子，失败即中断
    pub async fn trigger(
        &self,
        event: HookEvent,
        target: &mut UploadTarget,
    ) -> Result<(), FsError> {
        let Some(list) = self.hooks.get(&event) else {
            return Ok(());
        };
        for hook in list {
            if let Err(e) = hook.run(self, target).await {
                warn!(?event, "钩子执行失败: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }
}

/// 读取文件头并探测图片尺寸，非图片返回 None
fn probe_image_file(path: &str) -> Option<(u32, u32)> {
    use std::io::Read;
    let mut header = vec![0u8; 64 * 1024];
    let mut file = std::fs::File::open(path).ok()?;
    let n = file.read(&mut header).ok()?;
    probe_image_size(&header[..n])
}

/// 从字节头识别 PNG/JPEG/GIF/BMP 的宽高
fn probe_image_size(buf: &[u8]) -> Option<(u32, u32)> {
    // PNG
    if buf.len() > 24 && buf.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        let w = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let h = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);
        return Some((w, h));
    }
    // GIF
    if buf.len() > 10 && buf.starts_with(b"GIF8") {
        let w = u16::from_le_bytes([buf[6], buf[7]]) as u32;
        let h = u16::from_le_bytes([buf[8], buf[9]]) as u32;
        return Some((w, h));
    }
    // BMP
    if buf.len() > 26 && buf.starts_with(b"BM") {
        let w = u32::from_le_bytes([buf[18], buf[19], buf[20], buf[21]]);
        let h = u32::from_le_bytes([buf[22], buf[23], buf[24], buf[25]]);
        return Some((w, h));
    }
    // JPEG：扫描段直至 SOF 帧头
    if buf.len() > 4 && buf.starts_with(&[0xFF, 0xD8]) {
        let mut i = 2;
        while i + 9 < buf.len() {
            if buf[i] != 0xFF {
                return None;
            }
            let marker = buf[i + 1];
            match marker {
                // 填充
                0xFF => i += 1,
                // 独立标记
                0x01 | 0xD0..=0xD9 => i += 2,
                // SOF0-SOF15，排除 DHT/JPG/DAC
                0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                    let h = u16::from_be_bytes([buf[i + 5], buf[i + 6]]) as u32;
                    let w = u16::from_be_bytes([buf[i + 7], buf[i + 8]]) as u32;
                    return Some((w, h));
                }
                _ => {
                    let len = u16::from_be_bytes([buf[i + 2], buf[i + 3]]) as usize;
                    i += 2 + len;
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::tests::test_fixture;

    #[test]
    fn test_probe_png() {
        let mut buf = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        buf.extend_from_slice(&[0, 0, 0, 13]);
        buf.extend_from_slice(b"IHDR");
        buf.extend_from_slice(&800u32.to_be_bytes());
        buf.extend_from_slice(&600u32.to_be_bytes());
        buf.extend_from_slice(&[8, 6, 0, 0, 0]);
        assert_eq!(probe_image_size(&buf), Some((800, 600)));
    }

    #[test]
    fn test_probe_gif_and_garbage() {
        let mut buf = b"GIF89a".to_vec();
        buf.extend_from_slice(&320u16.to_le_bytes());
        buf.extend_from_slice(&240u16.to_le_bytes());
        buf.extend_from_slice(&[0, 0, 0]);
        assert_eq!(probe_image_size(&buf), Some((320, 240)));
        assert_eq!(probe_image_size(b"not an image at all"), None);
    }

    #[test]
    fn test_probe_jpeg_sof_scan() {
        // SOI + APP0(长度16) + SOF0
        let mut buf = vec![0xFF, 0xD8];
        buf.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        buf.extend_from_slice(&[0u8; 14]);
        buf.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        buf.extend_from_slice(&480u16.to_be_bytes());
        buf.extend_from_slice(&640u16.to_be_bytes());
        buf.extend_from_slice(&[3u8; 10]);
        assert_eq!(probe_image_size(&buf), Some((640, 480)));
    }

    #[tokio::test]
    async fn test_validate_file_hook() {
        let (_dir, _db, pool, uid) = test_fixture();
        let mut fs = pool.checkout(uid).unwrap();
        fs.policy.max_size = 100;

        let mut target = UploadTarget::default();
        target.info.file_name = "ok.txt".into();
        target.info.size = 50;
        Hook::ValidateFile.run(&fs, &mut target).await.unwrap();

        target.info.size = 200;
        assert!(matches!(
            Hook::ValidateFile.run(&fs, &mut target).await,
            Err(FsError::FileSizeTooBig)
        ));

        target.info.size = 50;
        target.info.file_name = "bad/name".into();
        assert!(matches!(
            Hook::ValidateFile.run(&fs, &mut target).await,
            Err(FsError::IllegalObjectName(_))
        ));
    }

    #[tokio::test]
    async fn test_generic_after_upload_creates_record() {
        let (_dir, db, pool, uid) = test_fixture();
        let fs = pool.checkout(uid).unwrap();

        let mut target = UploadTarget::default();
        target.info.file_name = "a.txt".into();
        target.info.virtual_path = "/docs".into();
        target.info.save_path = "uploads/1/a.txt".into();
        target.info.size = 7;

        Hook::GenericAfterUpload.run(&fs, &mut target).await.unwrap();
        let model = target.model.as_ref().unwrap();
        assert_eq!(model.name, "a.txt");
        assert_eq!(db.get_user_by_id(uid).unwrap().storage, 7);

        // 同名再传
        target.model = None;
        assert!(matches!(
            Hook::GenericAfterUpload.run(&fs, &mut target).await,
            Err(FsError::FileExisted)
        ));
    }

    #[tokio::test]
    async fn test_placeholder_conflict_and_replay() {
        let (_dir, _db, pool, uid) = test_fixture();
        let fs = pool.checkout(uid).unwrap();

        let mut target = UploadTarget::default();
        target.info.file_name = "big.bin".into();
        target.info.virtual_path = "/".into();
        target.info.save_path = "uploads/1/big.bin".into();
        target.info.upload_session_id = Some("sess-1".into());
        Hook::GenericAfterUpload.run(&fs, &mut target).await.unwrap();

        // 同一会话重放：复用占位记录
        let first_id = target.model.as_ref().unwrap().id;
        target.model = None;
        Hook::GenericAfterUpload.run(&fs, &mut target).await.unwrap();
        assert_eq!(target.model.as_ref().unwrap().id, first_id);

        // 其他会话撞名：会话冲突
        target.info.upload_session_id = Some("sess-2".into());
        assert!(matches!(
            Hook::GenericAfterUpload.run(&fs, &mut target).await,
            Err(FsError::UploadSessionExisted)
        ));

        // 无会话撞名：已有记录仍是占位文件，同样按会话冲突报告
        target.info.upload_session_id = None;
        assert!(matches!(
            Hook::GenericAfterUpload.run(&fs, &mut target).await,
            Err(FsError::UploadSessionExisted)
        ));
    }

    #[tokio::test]
    async fn test_chunk_hooks_track_quota() {
        let (_dir, db, pool, uid) = test_fixture();
        let fs = pool.checkout(uid).unwrap();

        let mut target = UploadTarget::default();
        target.info.file_name = "c.bin".into();
        target.info.virtual_path = "/".into();
        target.info.save_path = "uploads/1/c.bin".into();
        target.info.size = 0;
        target.info.upload_session_id = Some("sess-c".into());
        Hook::GenericAfterUpload.run(&fs, &mut target).await.unwrap();

        // 第一片 1024 字节写入成功
        target.info.append_start = 0;
        target.info.size = 1024;
        Hook::ChunkUploaded.run(&fs, &mut target).await.unwrap();
        assert_eq!(db.get_user_by_id(uid).unwrap().storage, 1024);

        // 第二片失败回退
        target.info.append_start = 1024;
        target.info.size = 1024;
        Hook::ChunkUploadFailed.run(&fs, &mut target).await.unwrap();
        assert_eq!(db.get_user_by_id(uid).unwrap().storage, 1024);
    }

    #[tokio::test]
    async fn test_trigger_order_and_clean() {
        let (_dir, _db, pool, uid) = test_fixture();
        let mut fs = pool.checkout(uid).unwrap();
        fs.use_hook(HookEvent::BeforeUpload, Hook::ClearFileSize);
        fs.use_hook(HookEvent::BeforeUpload, Hook::ValidateFile);

        let mut target = UploadTarget::default();
        target.info.file_name = "a.txt".into();
        target.info.size = 10;
        fs.trigger(HookEvent::BeforeUpload, &mut target).await.unwrap();
        // ClearFileSize 先执行
        assert_eq!(target.info.size, 0);

        fs.clean_hooks(Some(HookEvent::BeforeUpload));
        assert!(fs.hooks.get(&HookEvent::BeforeUpload).is_none());
    }
}
