//! 文件哈希工具
//!
//! 下载完成后的完整性校验辅助：流式读取文件计算摘要，十六进制
//! 小写输出。

use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// 流式读取的缓冲区大小
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// 支持的摘要算法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Md5,
    Sha1,
    Sha256,
}

impl HashKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashKind::Md5 => "md5",
            HashKind::Sha1 => "sha1",
            HashKind::Sha256 => "sha256",
        }
    }
}

/// 计算文件摘要（十六进制小写）
pub fn file_hash(path: &Path, kind: HashKind) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    match kind {
        HashKind::Md5 => {
            let mut context = md5::Context::new();
            loop {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                context.consume(&buffer[..read]);
            }
            Ok(format!("{:x}", context.compute()))
        }
        HashKind::Sha1 => {
            let mut hasher = Sha1::new();
            loop {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        HashKind::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}
