//! 统一错误类型定义
//!
//! 错误分类：
//! - 参数/校验错误（客户端可修正）
//! - 权限/用户组限制错误
//! - 对象不存在错误
//! - 容量不足错误
//! - 存储驱动 I/O 错误
//! - 集群/网络错误
//! - 内部配置错误
//! - 部分失败错误（批量操作中 N/M 项失败）

use thiserror::Error;

/// 文件系统核心错误
#[derive(Debug, Error)]
pub enum FsError {
    /// 对象名不合法
    #[error("对象名不合法: {0}")]
    IllegalObjectName(String),

    /// 文件大小超出策略限制
    #[error("文件大小超出限制")]
    FileSizeTooBig,

    /// 文件扩展名不被允许
    #[error("文件扩展名不被允许")]
    ExtensionNotAllowed,

    /// 剩余容量不足
    #[error("剩余容量不足")]
    InsufficientCapacity,

    /// 同名文件已存在
    #[error("同名文件已存在")]
    FileExisted,

    /// 同名文件的上传会话已存在（占位文件）
    #[error("同名文件正在上传中")]
    UploadSessionExisted,

    /// 对象不存在
    #[error("对象不存在")]
    ObjectNotExist,

    /// 上传会话不存在或已过期
    #[error("上传会话不存在或已过期")]
    SessionNotFound,

    /// 分片 Content-Length 与预期长度不符
    #[error("分片长度不符: 预期 {expected} 字节, 实际 {actual} 字节")]
    InvalidContentLength { expected: u64, actual: u64 },

    /// 未知存储策略类型
    #[error("未知存储策略类型: {0}")]
    UnknownPolicyType(String),

    /// 客户端取消了请求
    #[error("客户端已取消请求")]
    Canceled,

    /// 批量操作部分失败
    #[error("操作未全部成功: {failed}/{total} 项失败")]
    NotFullySuccess { failed: usize, total: usize },

    /// 无法插入文件记录
    #[error("无法插入文件记录")]
    InsertFileRecord,

    /// 存储驱动错误
    #[error("存储驱动错误: {0}")]
    Driver(#[from] DriverError),

    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// 数据库连接池错误
    #[error("数据库连接池错误: {0}")]
    DbPool(#[from] r2d2::Error),

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 存储驱动错误
#[derive(Debug, Error)]
pub enum DriverError {
    /// 物理同名文件已存在且不允许覆盖
    #[error("同名物理文件已存在: {0}")]
    PhysicalFileExisted(String),

    /// 追加偏移与现有文件长度不符
    #[error("追加偏移不符: 现有 {actual} 字节, 预期 {expected} 字节")]
    AppendOffsetMismatch { expected: u64, actual: u64 },

    /// 占位文件已存在，拒绝签发上传凭证
    #[error("占位文件已存在")]
    PlaceholderExisted,

    /// 驱动不支持该操作
    #[error("当前存储驱动不支持该操作")]
    NotSupported,

    /// 等待从机处理结果超时
    #[error("等待从机处理结果超时")]
    WaitResultTimeout,

    /// 从机返回错误
    #[error("从机返回错误: {0}")]
    SlaveFailure(String),

    /// 客户端取消
    #[error("传输已取消")]
    Canceled,

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP 请求错误
    #[error("HTTP 请求错误: {0}")]
    Http(#[from] reqwest::Error),

    /// 远端响应错误
    #[error("远端响应错误 (code={code}): {msg}")]
    RemoteResponse { code: i64, msg: String },
}

impl DriverError {
    /// 是否为取消导致的错误（取消不参与重试）
    pub fn is_canceled(&self) -> bool {
        matches!(self, DriverError::Canceled)
            || matches!(self, DriverError::Io(e) if e.kind() == std::io::ErrorKind::Interrupted)
    }
}

/// 集群错误
#[derive(Debug, Error)]
pub enum ClusterError {
    /// 无可用节点
    #[error("无可用节点")]
    NoNodesAvailable,

    /// 功能分组不存在
    #[error("功能分组不存在: {0}")]
    FeatureNotExist(String),

    /// 未找到主机记录
    #[error("未找到主机记录: {0}")]
    MasterNotFound(String),

    /// 节点心跳请求失败
    #[error("节点通信失败: {0}")]
    Rpc(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_canceled() {
        assert!(DriverError::Canceled.is_canceled());
        assert!(!DriverError::PlaceholderExisted.is_canceled());

        let io = DriverError::Io(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "interrupted",
        ));
        assert!(io.is_canceled());
    }

    #[test]
    fn test_partial_failure_message() {
        let err = FsError::NotFullySuccess {
            failed: 2,
            total: 5,
        };
        assert!(err.to_string().contains("2/5"));
    }
}
