//! 上传流上下文
//!
//! 定义写入模式、上传元信息与统一的字节源抽象。字节源可以是
//! 可寻址的磁盘文件，也可以是只能顺序读取的网络流。

use std::io::{self, Read, Seek, SeekFrom};
use std::ops::BitOr;
use std::path::Path;

/// 物理写入模式，可按位组合（如追加+覆盖表示重写某个分片）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteMode(u8);

impl WriteMode {
    /// 覆盖已有文件
    pub const OVERWRITE: WriteMode = WriteMode(0b001);
    /// 追加写入（分片上传）
    pub const APPEND: WriteMode = WriteMode(0b010);
    /// 不执行物理写入（仅建立元数据占位）
    pub const NOP: WriteMode = WriteMode(0b100);

    pub fn contains(self, other: WriteMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for WriteMode {
    type Output = WriteMode;

    fn bitor(self, rhs: WriteMode) -> WriteMode {
        WriteMode(self.0 | rhs.0)
    }
}

/// 上传元信息
#[derive(Debug, Clone, Default)]
pub struct UploadInfo {
    /// 内容字节数
    pub size: u64,
    /// 文件名
    pub file_name: String,
    /// 虚拟目录路径
    pub virtual_path: String,
    /// 物理保存路径
    pub save_path: String,
    /// 写入模式
    pub mode: WriteMode,
    /// 追加写入的起始偏移
    pub append_start: u64,
    /// 关联的上传会话
    pub upload_session_id: Option<String>,
    /// 最后修改时间（Unix 时间戳）
    pub last_modified: Option<i64>,
    /// 源文件物理路径（从机中转时由从机读取）
    pub src: String,
}

/// 可寻址的读取器
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

enum Source {
    /// 可寻址源（磁盘文件），分片重试可直接回退
    Seekable(Box<dyn ReadSeek>),
    /// 顺序流（网络请求体、压缩包条目）
    Stream(Box<dyn Read + Send>),
    /// 无内容（占位上传）
    Empty,
}

/// 上传字节源
pub struct FileStream {
    source: Source,
    /// 上传元信息
    pub info: UploadInfo,
}

impl FileStream {
    /// 从可寻址读取器构建
    pub fn from_seekable(reader: impl ReadSeek + 'static, info: UploadInfo) -> Self {
        Self {
            source: Source::Seekable(Box::new(reader)),
            info,
        }
    }

    /// 从顺序流构建
    pub fn from_reader(reader: impl Read + Send + 'static, info: UploadInfo) -> Self {
        Self {
            source: Source::Stream(Box::new(reader)),
            info,
        }
    }

    /// 打开磁盘文件作为上传源
    pub fn from_path(path: &Path, info: UploadInfo) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Ok(Self::from_seekable(file, info))
    }

    /// 无内容源，用于仅创建元数据的占位上传
    pub fn empty(info: UploadInfo) -> Self {
        Self {
            source: Source::Empty,
            info,
        }
    }

    /// 源是否可寻址
    pub fn seekable(&self) -> bool {
        matches!(self.source, Source::Seekable(_))
    }

    /// 回退到指定偏移，仅可寻址源支持
    pub fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        match &mut self.source {
            Source::Seekable(r) => {
                r.seek(SeekFrom::Start(offset))?;
                Ok(())
            }
            _ => Err(io::Error::new(io::ErrorKind::Unsupported, "源不可寻址")),
        }
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.source {
            Source::Seekable(r) => r.read(buf),
            Source::Stream(r) => r.read(buf),
            Source::Empty => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_write_mode_flags() {
        let mode = WriteMode::APPEND | WriteMode::OVERWRITE;
        assert!(mode.contains(WriteMode::APPEND));
        assert!(mode.contains(WriteMode::OVERWRITE));
        assert!(!mode.contains(WriteMode::NOP));
        assert!(!WriteMode::default().contains(WriteMode::OVERWRITE));
    }

    #[test]
    fn test_seekable_source() {
        let mut stream = FileStream::from_seekable(
            Cursor::new(b"hello world".to_vec()),
            UploadInfo::default(),
        );
        assert!(stream.seekable());

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        stream.seek_to(6).unwrap();
        let mut rest = String::new();
        stream.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "world");
    }

    #[test]
    fn test_stream_source_not_seekable() {
        let data: &[u8] = b"abc";
        let mut stream = FileStream::from_reader(data, UploadInfo::default());
        assert!(!stream.seekable());
        assert!(stream.seek_to(0).is_err());
    }

    #[test]
    fn test_empty_source() {
        let mut stream = FileStream::empty(UploadInfo::default());
        let mut buf = Vec::new();
        assert_eq!(stream.read_to_end(&mut buf).unwrap(), 0);
    }
}
