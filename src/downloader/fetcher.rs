//! 分段下载器
//!
//! 对一个任务并行跑 N 个分段 worker，每个 worker 负责一个字节区间，
//! 写入各自的 `.part<i>` 文件；全部成功后顺序合并为最终文件。
//! 每个分段独立走三次重试的阶梯，整体失败的分类交给引擎路由。

use crate::downloader::chunk;
use crate::downloader::task::{DownloadStatus, DownloadTask};
use crate::downloader::throttle::{per_worker_limit, RateLimiter};
use crate::downloader::ProgressCallback;
use crate::error::DownloadError;
use crate::transport::{validate_content_range, Transport};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// 每个分段的最大尝试次数
const MAX_CHUNK_ATTEMPTS: u32 = 3;

/// 分段重试的基础延迟
const BASE_CHUNK_RETRY_MS: u64 = 500;

/// 小分段的写缓冲
const SMALL_BUFFER: usize = 64 * 1024;

/// 大分段（≥ 8MB）的写缓冲
const LARGE_BUFFER: usize = 256 * 1024;

/// 启用大缓冲的分段长度阈值
const LARGE_BUFFER_THRESHOLD: i64 = 8 * 1024 * 1024;

/// 聚合轮询间隔
const AGGREGATE_POLL_MS: u64 = 100;

/// 聚合速度的刷新间隔
const SPEED_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// 单个分段一次尝试（或整个阶梯）的结局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// 字节数齐全
    Success,
    /// 200/416 等：服务器不支持该区间请求
    RangeUnsupported,
    /// 429/503：服务器在限流
    Throttled,
    /// 连接/读取中断或短读
    NetworkError,
    /// 用户暂停/取消
    Aborted,
    /// 不可重试的分段失败（写盘失败、区间错位等）
    Failed,
}

/// 分段结果汇总
#[derive(Debug, Default)]
pub struct SegmentedOutcome {
    pub all_success: bool,
    pub any_range_unsupported: bool,
    pub any_throttled: bool,
    pub any_network_error: bool,
    pub aborted: bool,
}

impl SegmentedOutcome {
    fn reduce(outcomes: &[ChunkOutcome]) -> Self {
        let mut reduced = Self {
            all_success: true,
            ..Self::default()
        };
        for outcome in outcomes {
            match outcome {
                ChunkOutcome::Success => {}
                ChunkOutcome::RangeUnsupported => {
                    reduced.all_success = false;
                    reduced.any_range_unsupported = true;
                }
                ChunkOutcome::Throttled => {
                    reduced.all_success = false;
                    reduced.any_throttled = true;
                }
                ChunkOutcome::NetworkError | ChunkOutcome::Failed => {
                    reduced.all_success = false;
                    reduced.any_network_error = true;
                }
                ChunkOutcome::Aborted => {
                    reduced.all_success = false;
                    reduced.aborted = true;
                }
            }
        }
        reduced
    }
}

/// 跑完一个任务的所有未完成分段
///
/// 前置条件：`total_size > 0`、分段已初始化并与磁盘对过账。
/// 返回汇总结局，由引擎决定合并、降级还是整体重试
pub async fn fetch_segmented(
    transport: Arc<Transport>,
    task: Arc<DownloadTask>,
    speed_limit: i64,
    progress: Option<ProgressCallback>,
) -> SegmentedOutcome {
    let final_path = task.final_path();
    let chunks = task.chunks_copy();
    let worker_limit = per_worker_limit(speed_limit, chunks.len());
    let token = transport.token_for(task.id());

    let mut join_set: JoinSet<ChunkOutcome> = JoinSet::new();
    let mut pending = 0usize;

    for (index, chunk) in chunks.iter().enumerate() {
        if chunk.completed {
            continue;
        }
        pending += 1;

        let transport = transport.clone();
        let task = task.clone();
        let part_path = chunk::part_path(&final_path, index);
        let token = token.clone();

        join_set.spawn(async move {
            run_chunk_worker(transport, task, index, part_path, worker_limit, token).await
        });
    }

    info!(
        "任务 {} 启动 {} 个分段 worker（共 {} 段，限速 {}/worker）",
        task.id(),
        pending,
        chunks.len(),
        worker_limit
    );

    // 100ms 轮询聚合：等待 worker 的同时刷新总速度
    let mut outcomes: Vec<ChunkOutcome> = Vec::with_capacity(pending);
    let mut last_speed_at = tokio::time::Instant::now();
    let mut last_downloaded = task.downloaded_size();

    while outcomes.len() < pending {
        match tokio::time::timeout(
            Duration::from_millis(AGGREGATE_POLL_MS),
            join_set.join_next(),
        )
        .await
        {
            Ok(Some(Ok(outcome))) => outcomes.push(outcome),
            Ok(Some(Err(e))) => {
                warn!("分段 worker 异常退出: {}", e);
                outcomes.push(ChunkOutcome::Failed);
            }
            Ok(None) => break,
            Err(_) => {}
        }

        let elapsed = last_speed_at.elapsed();
        if elapsed >= SPEED_UPDATE_INTERVAL {
            let downloaded = task.downloaded_size();
            let delta = downloaded - last_downloaded;
            if delta > 0 {
                task.set_speed(delta as f64 / elapsed.as_secs_f64());
            } else {
                task.set_speed(0.0);
            }
            last_speed_at = tokio::time::Instant::now();
            last_downloaded = downloaded;

            if let Some(cb) = &progress {
                cb(task.id(), downloaded, task.total_size(), task.speed());
            }
        }
    }

    let reduced = SegmentedOutcome::reduce(&outcomes);
    debug!("任务 {} 分段结局: {:?}", task.id(), reduced);
    reduced
}

/// 单个分段的重试阶梯
///
/// 最多 3 次尝试：限流按 `500ms·(attempt+1)` 缓退，其余可重试
/// 结局按 `500ms·2^attempt` 指数退避；成功/区间不支持/用户中止
/// 直接短路
async fn run_chunk_worker(
    transport: Arc<Transport>,
    task: Arc<DownloadTask>,
    index: usize,
    part_path: PathBuf,
    limit: i64,
    token: tokio_util::sync::CancellationToken,
) -> ChunkOutcome {
    let mut attempt: u32 = 0;
    loop {
        let outcome =
            download_chunk_once(&transport, &task, index, &part_path, limit, &token).await;

        match outcome {
            ChunkOutcome::Success
            | ChunkOutcome::RangeUnsupported
            | ChunkOutcome::Aborted
            | ChunkOutcome::Failed => return outcome,
            ChunkOutcome::Throttled | ChunkOutcome::NetworkError => {
                attempt += 1;
                if attempt >= MAX_CHUNK_ATTEMPTS {
                    warn!("分段 #{} 重试 {} 次后仍失败", index, attempt);
                    return outcome;
                }
                let delay_ms = if outcome == ChunkOutcome::Throttled {
                    BASE_CHUNK_RETRY_MS * attempt as u64
                } else {
                    BASE_CHUNK_RETRY_MS * (1u64 << (attempt - 1))
                };
                debug!(
                    "分段 #{} 第 {} 次重试，先等 {}ms（{:?}）",
                    index, attempt, delay_ms, outcome
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
}

/// 分段的单次尝试
async fn download_chunk_once(
    transport: &Arc<Transport>,
    task: &Arc<DownloadTask>,
    index: usize,
    part_path: &PathBuf,
    limit: i64,
    token: &tokio_util::sync::CancellationToken,
) -> ChunkOutcome {
    // 每次尝试都取最新的分段状态（上次尝试可能推进了 current）
    let chunk = {
        let chunks = task.chunks_copy();
        match chunks.get(index) {
            Some(c) => c.clone(),
            None => return ChunkOutcome::Failed,
        }
    };
    if chunk.completed {
        return ChunkOutcome::Success;
    }

    let range_start = chunk.current.max(chunk.start);
    let file_offset = range_start - chunk.start;
    let expected = chunk.end - range_start + 1;
    if expected <= 0 {
        return ChunkOutcome::Success;
    }

    // 先拿到响应再动文件，连接失败时不碰磁盘
    let response = match transport
        .get(&task.url(), &task.referer(), Some((range_start, chunk.end)))
        .await
    {
        Ok(resp) => resp,
        Err(_) if token.is_cancelled() => return ChunkOutcome::Aborted,
        Err(e) => {
            debug!("分段 #{} 请求失败: {}", index, e);
            return ChunkOutcome::NetworkError;
        }
    };

    let status = response.status();
    match status.as_u16() {
        206 => {}
        429 | 503 => return ChunkOutcome::Throttled,
        416 => return ChunkOutcome::RangeUnsupported,
        // 200 或其他未预期状态：服务器没按区间响应
        _ => return ChunkOutcome::RangeUnsupported,
    }

    // 起点错位的数据写进去就是脏文件，直接判废
    if validate_content_range(&response, range_start).is_err() {
        return ChunkOutcome::Failed;
    }

    // 打开 part 文件；不存在则新建
    let mut created = false;
    let file = match OpenOptions::new().write(true).open(part_path).await {
        Ok(f) => f,
        Err(_) => {
            created = true;
            match OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(part_path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    warn!("分段 #{} 打开 part 文件失败: {}", index, e);
                    return ChunkOutcome::Failed;
                }
            }
        }
    };

    // 记录要求从偏移处续写，文件却是新建的，写进去的字节会落错位置
    if created && file_offset > 0 {
        drop(file);
        let _ = tokio::fs::remove_file(part_path).await;
        warn!("分段 #{} 需要从偏移 {} 续写但 part 文件缺失，判废", index, file_offset);
        return ChunkOutcome::Failed;
    }

    let mut file = file;
    if file.seek(std::io::SeekFrom::Start(file_offset as u64)).await.is_err() {
        return ChunkOutcome::Failed;
    }

    let buffer_size = if chunk.length() >= LARGE_BUFFER_THRESHOLD {
        LARGE_BUFFER
    } else {
        SMALL_BUFFER
    };
    let mut writer = BufWriter::with_capacity(buffer_size, file);
    let mut limiter = RateLimiter::new(limit);
    let mut stream = response.bytes_stream();
    let mut received: i64 = 0;

    loop {
        // 状态翻转和取消令牌都能让读循环退出
        let status = task.status();
        if status == DownloadStatus::Paused || status == DownloadStatus::Cancelled {
            let _ = writer.flush().await;
            return ChunkOutcome::Aborted;
        }

        let next = tokio::select! {
            _ = token.cancelled() => {
                let _ = writer.flush().await;
                return ChunkOutcome::Aborted;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                if bytes.is_empty() {
                    continue;
                }
                if writer.write_all(&bytes).await.is_err() {
                    let _ = writer.flush().await;
                    return ChunkOutcome::Failed;
                }
                received += bytes.len() as i64;
                task.update_chunk(index, range_start + received);
                limiter.consume(bytes.len()).await;
            }
            Some(Err(e)) => {
                let _ = writer.flush().await;
                if token.is_cancelled() {
                    return ChunkOutcome::Aborted;
                }
                debug!("分段 #{} 读取中断（已收 {} bytes）: {}", index, received, e);
                return ChunkOutcome::NetworkError;
            }
            None => break,
        }
    }

    if writer.flush().await.is_err() {
        return ChunkOutcome::Failed;
    }

    if received != expected {
        warn!(
            "分段 #{} 短读: 收到 {} / 预期 {} bytes",
            index, received, expected
        );
        return ChunkOutcome::NetworkError;
    }

    debug!("分段 #{} 完成（{} bytes）", index, received);
    ChunkOutcome::Success
}

/// 顺序合并 part 文件
///
/// 任一环节 I/O 失败：删掉半成品、保留 part 以便重试；合并后大小
/// 与声明不符：连 part 一起删掉（数据已不可信）；成功后删除 part
pub async fn merge_parts(
    final_path: &std::path::Path,
    count: usize,
    total_size: i64,
) -> Result<(), DownloadError> {
    let mut output = match OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(final_path)
        .await
    {
        Ok(f) => f,
        Err(e) => return Err(DownloadError::Merge(format!("create output failed: {}", e))),
    };

    let mut buffer = vec![0u8; 1024 * 1024];
    let mut written: i64 = 0;

    for i in 0..count {
        let path = chunk::part_path(final_path, i);
        let mut input = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                drop(output);
                let _ = tokio::fs::remove_file(final_path).await;
                return Err(DownloadError::Merge(format!(
                    "open part {} failed: {}",
                    i, e
                )));
            }
        };

        loop {
            use tokio::io::AsyncReadExt;
            let n = match input.read(&mut buffer).await {
                Ok(n) => n,
                Err(e) => {
                    drop(output);
                    let _ = tokio::fs::remove_file(final_path).await;
                    return Err(DownloadError::Merge(format!(
                        "read part {} failed: {}",
                        i, e
                    )));
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = output.write_all(&buffer[..n]).await {
                drop(output);
                let _ = tokio::fs::remove_file(final_path).await;
                return Err(DownloadError::Merge(format!("write failed: {}", e)));
            }
            written += n as i64;
        }
    }

    if let Err(e) = output.flush().await {
        let _ = tokio::fs::remove_file(final_path).await;
        return Err(DownloadError::Merge(format!("flush failed: {}", e)));
    }
    if let Err(e) = output.sync_all().await {
        let _ = tokio::fs::remove_file(final_path).await;
        return Err(DownloadError::Merge(format!("sync failed: {}", e)));
    }
    drop(output);

    // 合并后校验大小；不符说明某个 part 本身就是坏的，全部清掉
    if total_size > 0 && written != total_size {
        let _ = tokio::fs::remove_file(final_path).await;
        chunk::remove_part_files(final_path, count).await;
        return Err(DownloadError::SizeMismatch {
            expected: total_size,
            actual: written,
        });
    }

    chunk::remove_part_files(final_path, count).await;
    info!("合并完成: {:?}（{} bytes）", final_path, written);
    Ok(())
}
