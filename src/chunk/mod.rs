//! 分片组
//!
//! 将上传字节源切分为固定大小的分片序列，支持逐片处理与失败重试：
//! - 可寻址源重试时直接回退到分片起始偏移；
//! - 不可寻址源启用重放缓冲后，首次读取时同步写入匿名临时文件，
//!   重试从临时文件重放，保证字节级一致；
//! - 临时文件由分片组独占持有，随句柄释放自动删除。

pub mod backoff;

use crate::error::DriverError;
use crate::fsctx::FileStream;
use backoff::ConstantBackoff;
use futures::future::BoxFuture;
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::debug;

/// 当前分片的只读描述
#[derive(Debug, Clone, Copy)]
pub struct ChunkInfo {
    /// 分片索引
    pub index: usize,
    /// 分片在文件中的起始偏移
    pub start: u64,
    /// 分片长度
    pub length: u64,
    /// 文件总大小
    pub total: u64,
    /// 是否为最后一个分片
    pub is_last: bool,
}

impl ChunkInfo {
    /// 生成 Content-Range 形式的头部值
    pub fn range_header(&self) -> String {
        format!(
            "bytes {}-{}/{}",
            self.start,
            self.start + self.length.max(1) - 1,
            self.total
        )
    }
}

/// 分片处理回调：接收分片描述与分片内容
pub type ProcessFn =
    Box<dyn FnMut(ChunkInfo, Vec<u8>) -> BoxFuture<'static, Result<(), DriverError>> + Send>;

/// 分片组
pub struct ChunkGroup {
    file: FileStream,
    chunk_size: u64,
    total_size: u64,
    chunk_num: u64,
    backoff: ConstantBackoff,
    enable_retry_buffer: bool,

    /// 当前分片索引，next() 之前为 None
    current: Option<u64>,
    /// 重放缓冲，仅不可寻址源使用；句柄释放即删除
    buffer_temp: Option<std::fs::File>,
    /// 缓冲中已写入的字节数
    buffer_len: u64,
}

impl ChunkGroup {
    /// 创建分片组
    ///
    /// chunk_size 为 0 表示不分片（整个文件作为单一分片）
    pub fn new(file: FileStream, chunk_size: u64, backoff: ConstantBackoff, use_buffer: bool) -> Self {
        let total_size = file.info.size;
        let chunk_size = if chunk_size == 0 { total_size } else { chunk_size };
        // 空文件也算一个长度为 0 的分片
        let chunk_num = if total_size == 0 {
            1
        } else {
            total_size.div_ceil(chunk_size)
        };

        Self {
            file,
            chunk_size,
            total_size,
            chunk_num,
            backoff,
            enable_retry_buffer: use_buffer,
            current: None,
            buffer_temp: None,
            buffer_len: 0,
        }
    }

    /// 前进到下一个分片，重置退避计数；分片耗尽时返回 false
    pub fn next(&mut self) -> bool {
        let next = match self.current {
            None => 0,
            Some(i) => i + 1,
        };
        self.current = Some(next);
        self.backoff.reset();
        self.drop_buffer();
        next < self.chunk_num
    }

    /// 当前分片索引
    pub fn index(&self) -> usize {
        self.current.unwrap_or(0) as usize
    }

    /// 分片总数
    pub fn num(&self) -> u64 {
        self.chunk_num
    }

    /// 文件总大小
    pub fn total(&self) -> u64 {
        self.total_size
    }

    /// 当前分片起始偏移
    pub fn start(&self) -> u64 {
        self.current.unwrap_or(0) * self.chunk_size
    }

    /// 当前分片长度：除最后一片外等于 chunk_size，最后一片为剩余字节数
    pub fn length(&self) -> u64 {
        if self.is_last() {
            self.total_size - self.chunk_size * (self.chunk_num - 1)
        } else {
            self.chunk_size
        }
    }

    /// 是否为最后一个分片
    pub fn is_last(&self) -> bool {
        self.current.unwrap_or(0) == self.chunk_num - 1
    }

    /// 当前分片描述
    pub fn info(&self) -> ChunkInfo {
        ChunkInfo {
            index: self.index(),
            start: self.start(),
            length: self.length(),
            total: self.total_size,
            is_last: self.is_last(),
        }
    }

    /// 重放缓冲是否完整可用
    fn buffer_available(&self) -> bool {
        self.buffer_temp.is_some() && self.buffer_len == self.length()
    }

    fn drop_buffer(&mut self) {
        // 匿名临时文件随句柄释放被系统删除
        self.buffer_temp = None;
        self.buffer_len = 0;
    }

    /// 读取当前分片内容
    ///
    /// 重试时优先从重放缓冲读取；首次读取不可寻址源时同步写入缓冲
    fn read_current(&mut self) -> Result<Vec<u8>, DriverError> {
        let length = self.length();

        let index = self.index();
        if self.buffer_len == length {
            if let Some(temp) = self.buffer_temp.as_mut() {
                debug!("分片 {} 从重放缓冲读取", index);
                temp.seek(SeekFrom::Start(0))?;
                let mut data = Vec::with_capacity(length as usize);
                temp.take(length).read_to_end(&mut data)?;
                return Ok(data);
            }
        }

        let mut data = Vec::with_capacity(length as usize);
        (&mut self.file).take(length).read_to_end(&mut data)?;

        if self.enable_retry_buffer && !self.file.seekable() {
            match tempfile::tempfile() {
                Ok(mut temp) => {
                    temp.write_all(&data)?;
                    self.buffer_len = data.len() as u64;
                    self.buffer_temp = Some(temp);
                }
                // 缓冲创建失败不阻断上传，只是失去重试能力
                Err(e) => debug!("创建分片重放缓冲失败: {}", e),
            }
        }
        Ok(data)
    }

    /// 处理当前分片
    ///
    /// 回调失败时，若错误不是取消、且（源可寻址或重放缓冲可用）、
    /// 且退避策略允许，则回退并重试；否则向上传播错误
    pub async fn process(&mut self, processor: &mut ProcessFn) -> Result<(), DriverError> {
        loop {
            let data = self.read_current()?;
            match processor(self.info(), data).await {
                Ok(()) => {
                    debug!("分片 {} 处理完成", self.index());
                    self.drop_buffer();
                    return Ok(());
                }
                Err(e) => {
                    let retriable = !e.is_canceled()
                        && (self.file.seekable() || self.buffer_available());
                    if !retriable || !self.backoff.next().await {
                        self.drop_buffer();
                        return Err(e);
                    }
                    if self.file.seekable() {
                        self.file.seek_to(self.start())?;
                    }
                    debug!("重试分片 {}, 上次错误: {}", self.index(), e);
                }
            }
        }
    }
}
