//! 文件系统门面
//!
//! 把用户、存储策略、驱动与钩子管线捆绑为一次操作的执行环境。
//! 实例从 [`FsPool`] 借出，用完归还；归还时清空钩子并等待
//! 后台收尾任务结束，保证取消监视器不会在归还后触发。

pub mod archive;
pub mod hooks;
pub mod upload;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::POLICY_PREFIX;
use crate::driver::{build_driver, shadow::ShadowDriver, ContentResponse, Driver, DriverEnv};
use crate::error::FsError;
use crate::models::{Database, File, Folder, Node, Policy, PolicyType, User};
use crate::mq::MessageBus;

pub use hooks::{Hook, HookEvent, UploadTarget};

/// 非法文件名字符
const ILLEGAL_NAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// 文件系统执行环境
pub struct FileSystem {
    pub user: User,
    pub policy: Policy,
    pub(crate) driver: Box<dyn Driver>,
    pub(crate) hooks: HashMap<HookEvent, Vec<Hook>>,
    pub(crate) db: Arc<Database>,
    pub(crate) env: DriverEnv,
    pub(crate) bus: Arc<MessageBus>,
    /// 后台收尾任务持有的锁，归还实例前等待其释放
    pub(crate) recycle_lock: Arc<tokio::sync::Mutex<()>>,
    /// 借出代次，归还后递增
    pub(crate) generation: u64,
}

impl FileSystem {
    /// 按当前策略重建驱动
    pub fn dispatch_driver(&mut self) -> Result<(), FsError> {
        self.driver = build_driver(&self.policy, &self.env)?;
        Ok(())
    }

    /// 切换到从机影子驱动，中转任务在从机执行时使用
    pub fn switch_to_shadow(&mut self, node: Node) -> Result<(), FsError> {
        let inner = build_driver(&self.policy, &self.env)?;
        self.driver = Box::new(ShadowDriver::new(
            node,
            inner,
            self.policy.clone(),
            self.bus.clone(),
            &self.env,
        ));
        Ok(())
    }

    // ========================================================================
    // 校验
    // ========================================================================

    /// 文件名合法性：非空、无保留字符、长度不超过 255
    pub fn validate_legal_name(&self, name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 255
            && !name.contains(ILLEGAL_NAME_CHARS)
            && name != "."
            && name != ".."
    }

    /// 大小不超过策略上限，0 表示不限
    pub fn validate_file_size(&self, size: u64) -> bool {
        self.policy.max_size == 0 || size <= self.policy.max_size
    }

    /// 扩展名在策略允许列表内，空列表表示不限
    pub fn validate_extension(&self, name: &str) -> bool {
        let allowed = &self.policy.options.file_type;
        if allowed.is_empty() {
            return true;
        }
        let ext = Path::new(name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        allowed.iter().any(|a| a.eq_ignore_ascii_case(&ext))
    }

    /// 校验剩余容量，读数据库中的最新账目
    pub fn validate_capacity(&self, size: u64) -> Result<(), FsError> {
        let user = self.db.get_user_by_id(self.user.id)?;
        if user.remaining_capacity() < size {
            return Err(FsError::InsufficientCapacity);
        }
        Ok(())
    }

    // ========================================================================
    // 目录与文件记录
    // ========================================================================

    /// 用户根目录，不存在则创建
    pub fn root_folder(&self) -> Result<Folder, FsError> {
        let id = self.db.create_folder(self.user.id, None, "/")?;
        self.db.get_folder_by_id(id)
    }

    /// 按虚拟路径逐级创建目录，返回最深一级
    pub fn create_directory(&self, virtual_path: &str) -> Result<Folder, FsError> {
        let mut current = self.root_folder()?;
        for seg in virtual_path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            if !self.validate_legal_name(seg) {
                return Err(FsError::IllegalObjectName(seg.to_string()));
            }
            let id = self.db.create_folder(self.user.id, Some(current.id), seg)?;
            current = self.db.get_folder_by_id(id)?;
        }
        Ok(current)
    }

    /// 目录下是否已有同名文件
    pub fn child_file(&self, folder: &Folder, name: &str) -> Result<Option<File>, FsError> {
        self.db.get_file_by_name(self.user.id, folder.id, name)
    }

    /// 列出虚拟目录内容
    pub fn list(&self, folder_id: i64) -> Result<(Vec<Folder>, Vec<File>), FsError> {
        let folders = self.db.list_folders_by_parent(folder_id)?;
        let files = self.db.list_files_by_folder(folder_id)?;
        Ok((folders, files))
    }

    // ========================================================================
    // 外链 / 缩略图 / 删除
    // ========================================================================

    /// 生成带签名的文件外链
    pub async fn sign_url(
        &self,
        file: &File,
        ttl: i64,
        is_download: bool,
    ) -> Result<String, FsError> {
        Ok(self
            .driver
            .source(file, &self.env.site_url, ttl, is_download)
            .await?)
    }

    /// 获取缩略图
    pub async fn get_thumb(&self, file: &File) -> Result<ContentResponse, FsError> {
        if file.is_placeholder() {
            return Err(FsError::ObjectNotExist);
        }
        Ok(self.driver.thumb(&file.source_name).await?)
    }

    /// 删除文件：先删物理，再删成功项的记录；任何一项失败都
    /// 保留其记录并以部分失败上报
    pub async fn delete_files(&self, ids: &[i64]) -> Result<(), FsError> {
        let files = self.db.get_files_by_ids(ids, self.user.id)?;
        if files.is_empty() {
            return Ok(());
        }

        let sources: Vec<String> = files.iter().map(|f| f.source_name.clone()).collect();
        let failed = self.driver.delete(&sources).await?;

        let mut failed_count = 0;
        for file in &files {
            if failed.contains(&file.source_name) {
                failed_count += 1;
                continue;
            }
            if let Err(e) = self.db.delete_file(file.id) {
                warn!(file_id = file.id, "删除文件记录失败: {}", e);
                failed_count += 1;
            }
        }

        if failed_count > 0 {
            return Err(FsError::NotFullySuccess {
                failed: failed_count,
                total: files.len(),
            });
        }
        Ok(())
    }
}

/// 文件系统实例池
///
/// 持有构建实例所需的共享依赖；借出与归还之间的代次计数用于
/// 识别过期实例。
pub struct FsPool {
    db: Arc<Database>,
    env: DriverEnv,
    bus: Arc<MessageBus>,
    generation: AtomicU64,
}

impl FsPool {
    pub fn new(db: Arc<Database>, env: DriverEnv, bus: Arc<MessageBus>) -> Self {
        Self {
            db,
            env,
            bus,
            generation: AtomicU64::new(0),
        }
    }

    pub fn env(&self) -> &DriverEnv {
        &self.env
    }

    fn build(&self, user: User, policy: Policy) -> Result<FileSystem, FsError> {
        let driver = build_driver(&policy, &self.env)?;
        Ok(FileSystem {
            user,
            policy,
            driver,
            hooks: HashMap::new(),
            db: self.db.clone(),
            env: self.env.clone(),
            bus: self.bus.clone(),
            recycle_lock: Arc::new(tokio::sync::Mutex::new(())),
            generation: self.generation.fetch_add(1, Ordering::SeqCst),
        })
    }

    /// 借出指定用户的实例，策略经缓存加载
    pub fn checkout(&self, user_id: i64) -> Result<FileSystem, FsError> {
        let user = self.db.get_user_by_id(user_id)?;
        let policy = self.load_policy(user.policy_id)?;
        self.build(user, policy)
    }

    /// 借出匿名实例，仅用于外部来源文件的元数据操作
    pub fn checkout_anonymous(&self) -> Result<FileSystem, FsError> {
        let user = User {
            id: 0,
            email: String::new(),
            storage: 0,
            max_storage: u64::MAX,
            policy_id: 0,
        };
        let policy = Policy {
            id: 0,
            name: "anonymous".into(),
            policy_type: PolicyType::Anonymous,
            server: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            max_size: 0,
            auto_rename: false,
            dir_name_rule: String::new(),
            file_name_rule: String::new(),
            base_url: String::new(),
            options: Default::default(),
        };
        self.build(user, policy)
    }

    /// 按 ID 加载策略，命中缓存则不读库
    pub fn load_policy(&self, policy_id: i64) -> Result<Policy, FsError> {
        let cache_key = format!("{}{}", POLICY_PREFIX, policy_id);
        if let Some(policy) = self.env.cache.get::<Policy>(&cache_key) {
            return Ok(policy);
        }
        let policy = self.db.get_policy_by_id(policy_id)?;
        self.env.cache.set(&cache_key, &policy, 0);
        Ok(policy)
    }

    /// 策略更新后清除缓存
    pub fn invalidate_policy(&self, policy_id: i64) {
        self.env.cache.delete(&format!("{}{}", POLICY_PREFIX, policy_id));
    }

    /// 归还实例：清空钩子，等待后台收尾任务结束
    pub async fn recycle(&self, mut fs: FileSystem) {
        fs.clean_hooks(None);
        // 等待缩略图等后台任务释放锁
        let _ = fs.recycle_lock.lock().await;
        debug!(generation = fs.generation, "文件系统实例已归还");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::config::AppConfig;
    use crate::models::PolicyOption;
    use crate::request::TpsLimiter;
    use tempfile::TempDir;

    /// 构建一套落在临时目录里的完整测试环境
    pub(crate) fn test_fixture() -> (TempDir, Arc<Database>, FsPool, i64) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("test.db")).unwrap());

        let policy = Policy {
            id: 0,
            name: "local".into(),
            policy_type: PolicyType::Local,
            server: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            max_size: 0,
            auto_rename: false,
            dir_name_rule: format!("{}/uploads/{{uid}}", dir.path().display()),
            file_name_rule: String::new(),
            base_url: String::new(),
            options: PolicyOption::default(),
        };
        let policy_id = db.save_policy(&policy).unwrap();
        let uid = db.create_user("a@b.c", 1 << 20, policy_id).unwrap();

        let config = AppConfig::default();
        let env = DriverEnv {
            cache: Arc::new(CacheStore::new()),
            limiter: Arc::new(TpsLimiter::new()),
            upload: config.upload,
            cluster: config.cluster,
            site_url: "https://pan.example.com".into(),
            site_id: "site-1".into(),
            site_secret: "secret".into(),
        };
        let pool = FsPool::new(db.clone(), env, Arc::new(MessageBus::new()));
        (dir, db, pool, uid)
    }

    #[test]
    fn test_checkout_builds_driver_for_user_policy() {
        let (_dir, _db, pool, uid) = test_fixture();
        let fs = pool.checkout(uid).unwrap();
        assert_eq!(fs.policy.policy_type, PolicyType::Local);
        assert_eq!(fs.user.id, uid);
    }

    #[test]
    fn test_generation_increases_per_checkout() {
        let (_dir, _db, pool, uid) = test_fixture();
        let a = pool.checkout(uid).unwrap();
        let b = pool.checkout(uid).unwrap();
        assert!(b.generation > a.generation);
    }

    #[test]
    fn test_policy_cache_and_invalidation() {
        let (_dir, db, pool, uid) = test_fixture();
        let fs = pool.checkout(uid).unwrap();
        let policy_id = fs.policy.id;

        // 改库不改缓存，读到的仍是旧值
        let mut updated = fs.policy.clone();
        updated.name = "renamed".into();
        db.save_policy(&updated).unwrap();
        assert_eq!(pool.load_policy(policy_id).unwrap().name, "local");

        pool.invalidate_policy(policy_id);
        assert_eq!(pool.load_policy(policy_id).unwrap().name, "renamed");
    }

    #[test]
    fn test_validators() {
        let (_dir, _db, pool, uid) = test_fixture();
        let mut fs = pool.checkout(uid).unwrap();

        assert!(fs.validate_legal_name("a.txt"));
        assert!(!fs.validate_legal_name(""));
        assert!(!fs.validate_legal_name("a/b.txt"));
        assert!(!fs.validate_legal_name(".."));

        fs.policy.max_size = 10;
        assert!(fs.validate_file_size(10));
        assert!(!fs.validate_file_size(11));

        fs.policy.options.file_type = vec!["jpg".into(), "png".into()];
        assert!(fs.validate_extension("a.JPG"));
        assert!(!fs.validate_extension("a.exe"));
        assert!(!fs.validate_extension("noext"));
    }

    #[test]
    fn test_create_directory_walks_segments() {
        let (_dir, db, pool, uid) = test_fixture();
        let fs = pool.checkout(uid).unwrap();

        let deep = fs.create_directory("/photos/2026/08").unwrap();
        assert_eq!(deep.name, "08");

        // 再次创建同路径得到同一目录
        let again = fs.create_directory("/photos/2026/08").unwrap();
        assert_eq!(deep.id, again.id);

        let root = fs.root_folder().unwrap();
        let (folders, _) = fs.list(root.id).unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].name, "photos");
        drop(db);
    }

    #[tokio::test]
    async fn test_delete_files_removes_physical_and_record() {
        let (dir, db, pool, uid) = test_fixture();
        let fs = pool.checkout(uid).unwrap();
        let root = fs.root_folder().unwrap();

        let present = dir.path().join("p.bin");
        std::fs::write(&present, b"x").unwrap();
        let f1 = File {
            name: "p.bin".into(),
            source_name: present.to_string_lossy().to_string(),
            user_id: uid,
            size: 1,
            folder_id: root.id,
            policy_id: fs.policy.id,
            ..Default::default()
        };
        let id1 = db.create_file(&f1).unwrap();

        fs.delete_files(&[id1]).await.unwrap();
        assert!(!present.exists());
        assert!(matches!(db.get_file_by_id(id1), Err(FsError::ObjectNotExist)));
        assert_eq!(db.get_user_by_id(uid).unwrap().storage, 0);
    }
}
