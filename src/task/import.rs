//! 外部目录导入任务
//!
//! 列举指定策略存储端上的已有目录，把物理文件登记为用户文件。
//! 只写数据库记录，不搬运文件内容。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{encode_props, parse_props, Job, JobDeps};
use crate::error::FsError;
use crate::models::{File, TaskRecord, TaskType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportProps {
    pub user_id: i64,
    /// 按该策略的驱动列举存储端
    pub policy_id: i64,
    /// 存储端上的源路径
    pub src: String,
    /// 登记到的虚拟目录
    pub dst: String,
    #[serde(default)]
    pub recursive: bool,
}

pub struct ImportTask {
    record_id: i64,
    props: ImportProps,
    deps: JobDeps,
}

impl ImportTask {
    pub fn create(deps: &JobDeps, props: ImportProps) -> Result<Self, FsError> {
        let record_id =
            deps.db
                .create_task(TaskType::Import, props.user_id, &encode_props(&props)?)?;
        Ok(Self {
            record_id,
            props,
            deps: deps.clone(),
        })
    }

    pub fn from_record(record: &TaskRecord, deps: &JobDeps) -> Result<Self, FsError> {
        Ok(Self {
            record_id: record.id,
            props: parse_props(record)?,
            deps: deps.clone(),
        })
    }
}

fn join_virtual(dst: &str, relative: &str) -> String {
    let mut joined = dst.trim_end_matches('/').to_string();
    for seg in relative.split('/').filter(|s| !s.is_empty()) {
        joined.push('/');
        joined.push_str(seg);
    }
    if joined.is_empty() {
        joined.push('/');
    }
    joined
}

#[async_trait]
impl Job for ImportTask {
    fn task_id(&self) -> i64 {
        self.record_id
    }

    async fn run(&self) -> Result<(), FsError> {
        let mut fs = self.deps.fs_pool.checkout(self.props.user_id)?;
        let result = async {
            // 导入按指定策略列举，可能不同于用户当前策略
            fs.policy = self.deps.fs_pool.load_policy(self.props.policy_id)?;
            fs.dispatch_driver()?;

            let objects = fs.driver.list(&self.props.src, self.props.recursive).await?;
            let total_size: u64 = objects.iter().filter(|o| !o.is_dir).map(|o| o.size).sum();
            fs.validate_capacity(total_size)?;

            fs.create_directory(&self.props.dst)?;
            for object in &objects {
                if object.is_dir {
                    fs.create_directory(&join_virtual(&self.props.dst, &object.relative_path))?;
                }
            }

            for object in objects.iter().filter(|o| !o.is_dir) {
                let parent = match object.relative_path.rsplit_once('/') {
                    Some((dir, _)) => join_virtual(&self.props.dst, dir),
                    None => self.props.dst.clone(),
                };
                let folder = fs.create_directory(&parent)?;
                let record = File {
                    name: object.name.clone(),
                    source_name: object.source.clone(),
                    user_id: fs.user.id,
                    size: object.size,
                    folder_id: folder.id,
                    policy_id: fs.policy.id,
                    ..Default::default()
                };
                match fs.db.create_file(&record) {
                    Ok(_) => {}
                    // 同名文件已登记过，跳过
                    Err(FsError::FileExisted) => {
                        warn!(name = %object.name, "文件已存在，跳过导入");
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        }
        .await;
        self.deps.fs_pool.recycle(fs).await;
        result
    }
}
