//! SQLite 持久层
//!
//! 通过 r2d2 连接池访问 SQLite。容量账目的不变量在这里维护：
//! 任何修改文件大小的操作都在同一事务内同步修正所属用户的
//! 已用容量，保证「用户文件大小之和 == 已用容量」。

use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info, warn};

use super::{
    DownloadRecord, DownloadStatus, DownloaderOption, File, Folder, Node, NodeStatus, NodeType,
    Policy, PolicyOption, PolicyType, TaskRecord, TaskStatus, TaskType, User,
};
use crate::error::FsError;

/// 数据库访问器
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// 打开数据库文件并初始化表结构
    pub fn open(db_path: &Path) -> Result<Self, FsError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FsError::Internal(format!("创建数据库目录失败: {}", e)))?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            // journal_mode 有返回行，不能走 pragma_update
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
            conn.pragma_update(None, "foreign_keys", "ON")
        });
        let pool = Pool::new(manager)?;
        let db = Self { pool };
        db.init_tables()?;
        Ok(db)
    }

    /// 仅用于测试：打开独立的临时数据库
    #[cfg(test)]
    pub fn open_temp(dir: &Path) -> Result<Self, FsError> {
        Self::open(&dir.join("test.db"))
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, FsError> {
        Ok(self.pool.get()?)
    }

    /// 初始化数据库表
    fn init_tables(&self) -> Result<(), FsError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                storage INTEGER NOT NULL DEFAULT 0,
                max_storage INTEGER NOT NULL DEFAULT 0,
                policy_id INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS policies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                server TEXT NOT NULL DEFAULT '',
                access_key TEXT NOT NULL DEFAULT '',
                secret_key TEXT NOT NULL DEFAULT '',
                max_size INTEGER NOT NULL DEFAULT 0,
                auto_rename INTEGER NOT NULL DEFAULT 0,
                dir_name_rule TEXT NOT NULL DEFAULT '',
                file_name_rule TEXT NOT NULL DEFAULT '',
                base_url TEXT NOT NULL DEFAULT '',
                options TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                parent_id INTEGER,
                owner_id INTEGER NOT NULL,
                UNIQUE(owner_id, parent_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_folders_parent ON folders(parent_id);

            CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                source_name TEXT NOT NULL DEFAULT '',
                user_id INTEGER NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                pic_info TEXT NOT NULL DEFAULT '',
                folder_id INTEGER NOT NULL,
                policy_id INTEGER NOT NULL,
                upload_session_id TEXT,
                metadata TEXT NOT NULL DEFAULT '',
                UNIQUE(user_id, folder_id, name)
            );
            CREATE INDEX IF NOT EXISTS idx_files_folder ON files(folder_id);
            CREATE INDEX IF NOT EXISTS idx_files_session ON files(upload_session_id);

            CREATE TABLE IF NOT EXISTS nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status INTEGER NOT NULL DEFAULT 0,
                name TEXT NOT NULL,
                type INTEGER NOT NULL DEFAULT 0,
                server TEXT NOT NULL DEFAULT '',
                slave_key TEXT NOT NULL DEFAULT '',
                master_key TEXT NOT NULL DEFAULT '',
                downloader_enabled INTEGER NOT NULL DEFAULT 0,
                downloader_options TEXT NOT NULL DEFAULT '{}',
                rank INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status INTEGER NOT NULL DEFAULT 0,
                type INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                error TEXT NOT NULL DEFAULT '',
                props TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

            CREATE TABLE IF NOT EXISTS downloads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status INTEGER NOT NULL DEFAULT 0,
                source TEXT NOT NULL DEFAULT '',
                total_size INTEGER NOT NULL DEFAULT 0,
                downloaded_size INTEGER NOT NULL DEFAULT 0,
                gid TEXT NOT NULL DEFAULT '',
                speed INTEGER NOT NULL DEFAULT 0,
                dst TEXT NOT NULL DEFAULT '',
                attrs TEXT NOT NULL DEFAULT '',
                error TEXT NOT NULL DEFAULT '',
                user_id INTEGER NOT NULL,
                task_id INTEGER,
                node_id INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_downloads_gid ON downloads(gid);
            "#,
        )?;

        info!("数据库表初始化完成");
        Ok(())
    }

    // ========================================================================
    // 用户
    // ========================================================================

    pub fn create_user(&self, email: &str, max_storage: u64, policy_id: i64) -> Result<i64, FsError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (email, storage, max_storage, policy_id) VALUES (?1, 0, ?2, ?3)",
            params![email, max_storage as i64, policy_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<User, FsError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, email, storage, max_storage, policy_id FROM users WHERE id = ?1",
            params![id],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    storage: row.get::<_, i64>(2)? as u64,
                    max_storage: row.get::<_, i64>(3)? as u64,
                    policy_id: row.get(4)?,
                })
            },
        )
        .optional()?
        .ok_or(FsError::ObjectNotExist)
    }

    // ========================================================================
    // 策略
    // ========================================================================

    pub fn save_policy(&self, policy: &Policy) -> Result<i64, FsError> {
        let conn = self.conn()?;
        let options = serde_json::to_string(&policy.options)
            .map_err(|e| FsError::Internal(format!("序列化策略选项失败: {}", e)))?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO policies (
                id, name, type, server, access_key, secret_key,
                max_size, auto_rename, dir_name_rule, file_name_rule, base_url, options
            ) VALUES (
                NULLIF(?1, 0), ?2, ?3, ?4, ?5, ?6,
                ?7, ?8, ?9, ?10, ?11, ?12
            )
            "#,
            params![
                policy.id,
                policy.name,
                policy.policy_type.as_str(),
                policy.server,
                policy.access_key,
                policy.secret_key,
                policy.max_size as i64,
                policy.auto_rename,
                policy.dir_name_rule,
                policy.file_name_rule,
                policy.base_url,
                options,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_policy_by_id(&self, id: i64) -> Result<Policy, FsError> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT id, name, type, server, access_key, secret_key,
                   max_size, auto_rename, dir_name_rule, file_name_rule, base_url, options
            FROM policies WHERE id = ?1
            "#,
            params![id],
            |row| {
                let type_str: String = row.get(2)?;
                let options_json: String = row.get(11)?;
                Ok(Policy {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    policy_type: PolicyType::from_str(&type_str)
                        .unwrap_or(PolicyType::Local),
                    server: row.get(3)?,
                    access_key: row.get(4)?,
                    secret_key: row.get(5)?,
                    max_size: row.get::<_, i64>(6)? as u64,
                    auto_rename: row.get(7)?,
                    dir_name_rule: row.get(8)?,
                    file_name_rule: row.get(9)?,
                    base_url: row.get(10)?,
                    options: serde_json::from_str::<PolicyOption>(&options_json)
                        .unwrap_or_default(),
                })
            },
        )
        .optional()?
        .ok_or(FsError::ObjectNotExist)
    }

    // ========================================================================
    // 目录
    // ========================================================================

    /// 创建目录；同名目录已存在时返回已有目录的 ID
    pub fn create_folder(
        &self,
        owner_id: i64,
        parent_id: Option<i64>,
        name: &str,
    ) -> Result<i64, FsError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO folders (name, parent_id, owner_id) VALUES (?1, ?2, ?3)",
            params![name, parent_id, owner_id],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM folders WHERE owner_id = ?1 AND parent_id IS ?2 AND name = ?3",
            params![owner_id, parent_id, name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_folder_by_id(&self, id: i64) -> Result<Folder, FsError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, parent_id, owner_id FROM folders WHERE id = ?1",
            params![id],
            |row| {
                Ok(Folder {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    parent_id: row.get(2)?,
                    owner_id: row.get(3)?,
                })
            },
        )
        .optional()?
        .ok_or(FsError::ObjectNotExist)
    }

    // ========================================================================
    // 文件
    // ========================================================================

    /// 插入文件记录，同一事务内为所属用户增加已用容量
    pub fn create_file(&self, file: &File) -> Result<i64, FsError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            r#"
            INSERT OR IGNORE INTO files (
                name, source_name, user_id, size, pic_info,
                folder_id, policy_id, upload_session_id, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                file.name,
                file.source_name,
                file.user_id,
                file.size as i64,
                file.pic_info,
                file.folder_id,
                file.policy_id,
                file.upload_session_id,
                file.metadata,
            ],
        )?;
        if inserted == 0 {
            // 同目录同名文件已存在
            return Err(FsError::FileExisted);
        }
        let id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE users SET storage = storage + ?1 WHERE id = ?2",
            params![file.size as i64, file.user_id],
        )?;
        tx.commit()?;

        debug!(file_id = id, size = file.size, "已插入文件记录");
        Ok(id)
    }

    pub fn get_file_by_id(&self, id: i64) -> Result<File, FsError> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT id, name, source_name, user_id, size, pic_info,
                   folder_id, policy_id, upload_session_id, metadata
            FROM files WHERE id = ?1
            "#,
            params![id],
            row_to_file,
        )
        .optional()?
        .ok_or(FsError::ObjectNotExist)
    }

    /// 按目录与文件名查找
    pub fn get_file_by_name(
        &self,
        user_id: i64,
        folder_id: i64,
        name: &str,
    ) -> Result<Option<File>, FsError> {
        let conn = self.conn()?;
        let file = conn
            .query_row(
                r#"
                SELECT id, name, source_name, user_id, size, pic_info,
                       folder_id, policy_id, upload_session_id, metadata
                FROM files WHERE user_id = ?1 AND folder_id = ?2 AND name = ?3
                "#,
                params![user_id, folder_id, name],
                row_to_file,
            )
            .optional()?;
        Ok(file)
    }

    pub fn get_file_by_upload_session(&self, session_id: &str) -> Result<Option<File>, FsError> {
        let conn = self.conn()?;
        let file = conn
            .query_row(
                r#"
                SELECT id, name, source_name, user_id, size, pic_info,
                       folder_id, policy_id, upload_session_id, metadata
                FROM files WHERE upload_session_id = ?1
                "#,
                params![session_id],
                row_to_file,
            )
            .optional()?;
        Ok(file)
    }

    pub fn get_files_by_ids(&self, ids: &[i64], user_id: i64) -> Result<Vec<File>, FsError> {
        let conn = self.conn()?;
        let mut files = Vec::new();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, source_name, user_id, size, pic_info,
                   folder_id, policy_id, upload_session_id, metadata
            FROM files WHERE id = ?1 AND user_id = ?2
            "#,
        )?;
        for id in ids {
            if let Some(f) = stmt.query_row(params![id, user_id], row_to_file).optional()? {
                files.push(f);
            }
        }
        Ok(files)
    }

    pub fn list_files_by_folder(&self, folder_id: i64) -> Result<Vec<File>, FsError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, source_name, user_id, size, pic_info,
                   folder_id, policy_id, upload_session_id, metadata
            FROM files WHERE folder_id = ?1 ORDER BY name
            "#,
        )?;
        let rows = stmt.query_map(params![folder_id], row_to_file)?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    pub fn list_folders_by_parent(&self, parent_id: i64) -> Result<Vec<Folder>, FsError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, parent_id, owner_id FROM folders WHERE parent_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![parent_id], |row| {
            Ok(Folder {
                id: row.get(0)?,
                name: row.get(1)?,
                parent_id: row.get(2)?,
                owner_id: row.get(3)?,
            })
        })?;
        let mut folders = Vec::new();
        for row in rows {
            folders.push(row?);
        }
        Ok(folders)
    }

    /// 修改文件大小，同一事务内按差值修正用户已用容量
    pub fn update_file_size(&self, file_id: i64, new_size: u64) -> Result<(), FsError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let (old_size, user_id): (i64, i64) = tx
            .query_row(
                "SELECT size, user_id FROM files WHERE id = ?1",
                params![file_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or(FsError::ObjectNotExist)?;

        let delta = new_size as i64 - old_size;
        tx.execute(
            "UPDATE files SET size = ?1 WHERE id = ?2",
            params![new_size as i64, file_id],
        )?;
        tx.execute(
            "UPDATE users SET storage = MAX(storage + ?1, 0) WHERE id = ?2",
            params![delta, user_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// 占位文件转正：清除会话标记并写入探针信息
    pub fn pop_chunk_to_file(&self, file_id: i64, pic_info: &str) -> Result<(), FsError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE files SET upload_session_id = NULL, pic_info = ?1 WHERE id = ?2",
            params![pic_info, file_id],
        )?;
        if updated == 0 {
            return Err(FsError::ObjectNotExist);
        }
        Ok(())
    }

    /// 写入图片探针信息
    pub fn set_pic_info(&self, file_id: i64, pic_info: &str) -> Result<(), FsError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE files SET pic_info = ?1 WHERE id = ?2",
            params![pic_info, file_id],
        )?;
        Ok(())
    }

    /// 删除文件记录，同一事务内归还用户已用容量
    pub fn delete_file(&self, file_id: i64) -> Result<(), FsError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let row: Option<(i64, i64)> = tx
            .query_row(
                "SELECT size, user_id FROM files WHERE id = ?1",
                params![file_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((size, user_id)) = row else {
            // 已被删除，视为成功
            return Ok(());
        };

        tx.execute("DELETE FROM files WHERE id = ?1", params![file_id])?;
        tx.execute(
            "UPDATE users SET storage = MAX(storage - ?1, 0) WHERE id = ?2",
            params![size, user_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // 节点
    // ========================================================================

    pub fn save_node(&self, node: &Node) -> Result<i64, FsError> {
        let conn = self.conn()?;
        let options = serde_json::to_string(&node.downloader_options)
            .map_err(|e| FsError::Internal(format!("序列化节点配置失败: {}", e)))?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO nodes (
                id, status, name, type, server, slave_key, master_key,
                downloader_enabled, downloader_options, rank
            ) VALUES (NULLIF(?1, 0), ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                node.id,
                node.status as i64,
                node.name,
                node.node_type as i64,
                node.server,
                node.slave_key,
                node.master_key,
                node.downloader_enabled,
                options,
                node.rank,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_node_by_id(&self, id: i64) -> Result<Node, FsError> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT id, status, name, type, server, slave_key, master_key,
                   downloader_enabled, downloader_options, rank
            FROM nodes WHERE id = ?1
            "#,
            params![id],
            row_to_node,
        )
        .optional()?
        .ok_or(FsError::ObjectNotExist)
    }

    pub fn get_nodes_by_status(&self, status: NodeStatus) -> Result<Vec<Node>, FsError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, status, name, type, server, slave_key, master_key,
                   downloader_enabled, downloader_options, rank
            FROM nodes WHERE status = ?1 ORDER BY rank
            "#,
        )?;
        let rows = stmt.query_map(params![status as i64], row_to_node)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?);
        }
        Ok(nodes)
    }

    pub fn set_node_status(&self, node_id: i64, status: NodeStatus) -> Result<(), FsError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE nodes SET status = ?1 WHERE id = ?2",
            params![status as i64, node_id],
        )?;
        Ok(())
    }

    // ========================================================================
    // 任务
    // ========================================================================

    pub fn create_task(
        &self,
        task_type: TaskType,
        user_id: i64,
        props: &str,
    ) -> Result<i64, FsError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tasks (status, type, user_id, progress, error, props) VALUES (?1, ?2, ?3, 0, '', ?4)",
            params![TaskStatus::Queued as i64, task_type as i64, user_id, props],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_task_by_id(&self, id: i64) -> Result<TaskRecord, FsError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, status, type, user_id, progress, error, props FROM tasks WHERE id = ?1",
            params![id],
            row_to_task,
        )
        .optional()?
        .ok_or(FsError::ObjectNotExist)
    }

    pub fn get_tasks_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<TaskRecord>, FsError> {
        let conn = self.conn()?;
        let mut tasks = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT id, status, type, user_id, progress, error, props FROM tasks WHERE status = ?1",
        )?;
        for status in statuses {
            let rows = stmt.query_map(params![*status as i64], row_to_task)?;
            for row in rows {
                match row {
                    Ok(t) => tasks.push(t),
                    Err(e) => warn!("读取任务记录失败: {}", e),
                }
            }
        }
        Ok(tasks)
    }

    pub fn set_task_status(&self, task_id: i64, status: TaskStatus) -> Result<(), FsError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET status = ?1 WHERE id = ?2",
            params![status as i64, task_id],
        )?;
        Ok(())
    }

    pub fn set_task_progress(&self, task_id: i64, progress: i64) -> Result<(), FsError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET progress = ?1 WHERE id = ?2",
            params![progress, task_id],
        )?;
        Ok(())
    }

    pub fn set_task_error(&self, task_id: i64, error: &str) -> Result<(), FsError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET status = ?1, error = ?2 WHERE id = ?3",
            params![TaskStatus::Error as i64, error, task_id],
        )?;
        Ok(())
    }

    // ========================================================================
    // 离线下载
    // ========================================================================

    pub fn create_download(&self, record: &DownloadRecord) -> Result<i64, FsError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO downloads (
                status, source, total_size, downloaded_size, gid, speed,
                dst, attrs, error, user_id, task_id, node_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                record.status as i64,
                record.source,
                record.total_size as i64,
                record.downloaded_size as i64,
                record.gid,
                record.speed,
                record.dst,
                record.attrs,
                record.error,
                record.user_id,
                record.task_id,
                record.node_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn save_download(&self, record: &DownloadRecord) -> Result<(), FsError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"
            UPDATE downloads SET
                status = ?1, source = ?2, total_size = ?3, downloaded_size = ?4,
                gid = ?5, speed = ?6, dst = ?7, attrs = ?8, error = ?9,
                task_id = ?10, node_id = ?11
            WHERE id = ?12
            "#,
            params![
                record.status as i64,
                record.source,
                record.total_size as i64,
                record.downloaded_size as i64,
                record.gid,
                record.speed,
                record.dst,
                record.attrs,
                record.error,
                record.task_id,
                record.node_id,
                record.id,
            ],
        )?;
        if updated == 0 {
            return Err(FsError::ObjectNotExist);
        }
        Ok(())
    }

    pub fn get_download_by_gid(&self, gid: &str, user_id: i64) -> Result<DownloadRecord, FsError> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT id, status, source, total_size, downloaded_size, gid, speed,
                   dst, attrs, error, user_id, task_id, node_id
            FROM downloads WHERE gid = ?1 AND user_id = ?2
            "#,
            params![gid, user_id],
            row_to_download,
        )
        .optional()?
        .ok_or(FsError::ObjectNotExist)
    }

    pub fn get_downloads_by_status(
        &self,
        statuses: &[DownloadStatus],
    ) -> Result<Vec<DownloadRecord>, FsError> {
        let conn = self.conn()?;
        let mut records = Vec::new();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, status, source, total_size, downloaded_size, gid, speed,
                   dst, attrs, error, user_id, task_id, node_id
            FROM downloads WHERE status = ?1
            "#,
        )?;
        for status in statuses {
            let rows = stmt.query_map(params![*status as i64], row_to_download)?;
            for row in rows {
                records.push(row?);
            }
        }
        Ok(records)
    }
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<File> {
    Ok(File {
        id: row.get(0)?,
        name: row.get(1)?,
        source_name: row.get(2)?,
        user_id: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        pic_info: row.get(5)?,
        folder_id: row.get(6)?,
        policy_id: row.get(7)?,
        upload_session_id: row.get(8)?,
        metadata: row.get(9)?,
    })
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
    let options_json: String = row.get(8)?;
    Ok(Node {
        id: row.get(0)?,
        status: NodeStatus::from_i64(row.get(1)?),
        name: row.get(2)?,
        node_type: if row.get::<_, i64>(3)? == 1 {
            NodeType::Master
        } else {
            NodeType::Slave
        },
        server: row.get(4)?,
        slave_key: row.get(5)?,
        master_key: row.get(6)?,
        downloader_enabled: row.get(7)?,
        downloader_options: serde_json::from_str::<DownloaderOption>(&options_json)
            .unwrap_or_default(),
        rank: row.get(9)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        id: row.get(0)?,
        status: TaskStatus::from_i64(row.get(1)?),
        task_type: TaskType::from_i64(row.get(2)?).unwrap_or(TaskType::Transfer),
        user_id: row.get(3)?,
        progress: row.get(4)?,
        error: row.get(5)?,
        props: row.get(6)?,
    })
}

fn row_to_download(row: &rusqlite::Row<'_>) -> rusqlite::Result<DownloadRecord> {
    Ok(DownloadRecord {
        id: row.get(0)?,
        status: DownloadStatus::from_i64(row.get(1)?),
        source: row.get(2)?,
        total_size: row.get::<_, i64>(3)? as u64,
        downloaded_size: row.get::<_, i64>(4)? as u64,
        gid: row.get(5)?,
        speed: row.get(6)?,
        dst: row.get(7)?,
        attrs: row.get(8)?,
        error: row.get(9)?,
        user_id: row.get(10)?,
        task_id: row.get(11)?,
        node_id: row.get(12)?,
    })
}
