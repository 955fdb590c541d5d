// 更新包完整性校验
//
// 算法由清单中的十六进制长度决定: 32 -> MD5, 40 -> SHA-1, 64 -> SHA-256。
// 哈希计算在阻塞线程池中进行，每读一块检查一次取消令牌。

use anyhow::{Context, Result};
use sha2::Digest;
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn from_hex(hex: &str) -> Option<Self> {
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        match hex.len() {
            32 => Some(ChecksumAlgorithm::Md5),
            40 => Some(ChecksumAlgorithm::Sha1),
            64 => Some(ChecksumAlgorithm::Sha256),
            _ => None,
        }
    }
}

enum Hasher {
    Md5(md5::Context),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl Hasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => Hasher::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(ctx) => ctx.consume(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(ctx) => format!("{:x}", ctx.compute()),
            Hasher::Sha1(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// 校验结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Match,
    Mismatch { expected: String, actual: String },
    /// 校验过程中被取消（暂停或删除）
    Cancelled,
}

pub struct Verifier;

impl Verifier {
    /// 校验文件是否与期望的校验和一致（大小写不敏感）
    pub async fn verify(
        path: &Path,
        expected: &str,
        cancel: CancellationToken,
    ) -> Result<VerifyOutcome> {
        let algorithm = ChecksumAlgorithm::from_hex(expected)
            .with_context(|| format!("无法识别的校验和: {}", expected))?;
        let path = path.to_path_buf();
        let expected = expected.to_ascii_lowercase();

        debug!("开始校验: {:?}, 算法={:?}", path, algorithm);

        let actual = tokio::task::spawn_blocking(move || hash_file(&path, algorithm, &cancel))
            .await
            .context("校验任务执行失败")??;

        let Some(actual) = actual else {
            return Ok(VerifyOutcome::Cancelled);
        };

        if actual == expected {
            info!("校验通过: {}", actual);
            Ok(VerifyOutcome::Match)
        } else {
            Ok(VerifyOutcome::Mismatch { expected, actual })
        }
    }

    /// 计算文件摘要（小写十六进制）
    pub async fn digest(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
        let path: PathBuf = path.to_path_buf();
        let token = CancellationToken::new();
        let digest = tokio::task::spawn_blocking(move || hash_file(&path, algorithm, &token))
            .await
            .context("计算哈希任务执行失败")??;
        digest.context("计算哈希被取消")
    }
}

/// 取消时返回 Ok(None)
fn hash_file(
    path: &Path,
    algorithm: ChecksumAlgorithm,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let file = std::fs::File::open(path).with_context(|| format!("无法打开文件: {:?}", path))?;
    let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let n = reader.read(&mut buffer).context("读取文件失败")?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(Some(hasher.finalize_hex()))
}
