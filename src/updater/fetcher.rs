// 可断点续传的下载器
//
// 传输层只负责按字节偏移打开数据流；文件的追加/截断、大小上限、进度节流和取消
// 都在这里处理。下载失败不会自动重试，部分文件保留供手动恢复。

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::ProgressThrottler;

/// 响应数据流
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// 传输层打开的响应
pub struct FetchResponse {
    /// 服务器是否接受了字节范围请求
    pub resumed: bool,
    /// 完整文件大小（服务器提供时）
    pub total_size: Option<u64>,
    pub body: ByteStream,
}

/// 支持字节范围请求的传输层
#[async_trait]
pub trait FetchTransport: Send + Sync {
    /// 从 `range_start` 开始请求 `url`，`range_start == 0` 表示完整下载
    async fn open(&self, url: &str, range_start: u64) -> Result<FetchResponse>;
}

/// 基于 reqwest 的 HTTP 传输
pub struct HttpFetchTransport {
    client: Client,
}

impl HttpFetchTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("ota-updater/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("创建 HTTP 客户端失败")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FetchTransport for HttpFetchTransport {
    async fn open(&self, url: &str, range_start: u64) -> Result<FetchResponse> {
        let mut request = self.client.get(url);
        if range_start > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", range_start));
        }

        let response = request.send().await.context("发送下载请求失败")?;
        let status = response.status();

        let resumed = match status {
            StatusCode::PARTIAL_CONTENT => range_start > 0,
            s if s.is_success() => false,
            s => anyhow::bail!("服务器返回错误状态: {}", s),
        };

        let total_size = response.content_length().map(|len| {
            if resumed {
                len + range_start
            } else {
                len
            }
        });

        debug!(
            "下载连接建立: url={}, status={}, resumed={}, total={:?}",
            url, status, resumed, total_size
        );

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).context("读取数据流失败"))
            .boxed();

        Ok(FetchResponse {
            resumed,
            total_size,
            body,
        })
    }
}

/// 一次下载请求
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub id: String,
    pub url: String,
    pub dest: PathBuf,
    pub expected_size: u64,
}

/// 下载过程中的通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// 连接已建立，数据从 `offset` 处开始写入
    Connected { resumed: bool, offset: u64 },
    /// 文件当前大小
    Progress { bytes: u64 },
}

/// 下载结束结果，`bytes` 为文件最终大小
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Completed { bytes: u64 },
    Cancelled { bytes: u64 },
    Failed { bytes: u64, error: String },
}

/// 断点续传下载器
#[derive(Clone)]
pub struct Fetcher {
    transport: Arc<dyn FetchTransport>,
    progress_interval: Duration,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn FetchTransport>, progress_interval: Duration) -> Self {
        Self {
            transport,
            progress_interval,
        }
    }

    pub fn transport(&self) -> &Arc<dyn FetchTransport> {
        &self.transport
    }

    /// 下载到目标文件，直到完成、失败或被取消
    pub async fn run<F>(
        &self,
        request: FetchRequest,
        cancel: CancellationToken,
        mut on_event: F,
    ) -> FetchOutcome
    where
        F: FnMut(FetchEvent) + Send,
    {
        let existing = fs::metadata(&request.dest)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        // 只有比预期小的部分文件才续传，其余情况重新下载
        let offset = if existing > 0 && existing < request.expected_size {
            existing
        } else {
            0
        };

        info!(
            "开始下载更新: id={}, offset={}/{}",
            request.id, offset, request.expected_size
        );

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return FetchOutcome::Cancelled { bytes: existing },
            response = self.transport.open(&request.url, offset) => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!("下载连接失败: id={}, 错误: {:#}", request.id, e);
                return FetchOutcome::Failed {
                    bytes: existing,
                    error: format!("{:#}", e),
                };
            }
        };

        let offset = if response.resumed { offset } else { 0 };
        if let Some(total) = response.total_size {
            if total != request.expected_size {
                return FetchOutcome::Failed {
                    bytes: existing,
                    error: format!(
                        "服务器文件大小 {} 与清单 {} 不一致",
                        total, request.expected_size
                    ),
                };
            }
        }

        let mut file = match open_destination(&request, offset).await {
            Ok(file) => file,
            Err(e) => {
                return FetchOutcome::Failed {
                    bytes: existing,
                    error: format!("{:#}", e),
                }
            }
        };

        on_event(FetchEvent::Connected {
            resumed: response.resumed,
            offset,
        });

        let throttler = ProgressThrottler::new(self.progress_interval);
        let mut body = response.body;
        let mut written = offset;

        let failure = loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if let Err(e) = file.flush().await {
                        warn!("暂停时刷新文件失败: {}", e);
                    }
                    info!("下载已停止: id={}, 已下载 {} bytes", request.id, written);
                    return FetchOutcome::Cancelled { bytes: written };
                }
                chunk = body.next() => chunk,
            };

            let data = match chunk {
                None => break None,
                Some(Ok(data)) => data,
                Some(Err(e)) => break Some(format!("{:#}", e)),
            };

            // 文件大小不能超过清单声明的大小
            if written + data.len() as u64 > request.expected_size {
                break Some(format!(
                    "服务器返回的数据超过预期大小 {}",
                    request.expected_size
                ));
            }

            if let Err(e) = file.write_all(&data).await {
                break Some(format!("写入文件失败: {}", e));
            }
            written += data.len() as u64;

            if throttler.should_emit() {
                on_event(FetchEvent::Progress { bytes: written });
            }
        };

        if let Err(e) = file.flush().await {
            return FetchOutcome::Failed {
                bytes: written,
                error: format!("刷新文件缓冲失败: {}", e),
            };
        }

        if let Some(error) = failure {
            warn!("下载失败: id={}, 错误: {}", request.id, error);
            return FetchOutcome::Failed {
                bytes: written,
                error,
            };
        }

        if written != request.expected_size {
            return FetchOutcome::Failed {
                bytes: written,
                error: format!("连接提前结束: {}/{}", written, request.expected_size),
            };
        }

        throttler.force_emit();
        on_event(FetchEvent::Progress { bytes: written });
        info!("下载完成: id={}, {} bytes", request.id, written);
        FetchOutcome::Completed { bytes: written }
    }
}

/// 续传时追加写入，否则截断重写
async fn open_destination(request: &FetchRequest, offset: u64) -> Result<File> {
    if let Some(parent) = request.dest.parent() {
        fs::create_dir_all(parent)
            .await
            .context("创建下载目录失败")?;
    }

    let mut options = OpenOptions::new();
    if offset > 0 {
        options.append(true);
    } else {
        options.write(true).create(true).truncate(true);
    }
    options
        .open(&request.dest)
        .await
        .with_context(|| format!("打开下载文件失败: {:?}", request.dest))
}
