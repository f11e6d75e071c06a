//! 分段模型
//!
//! 一个分段对应最终文件的一个连续字节区间，由一个 worker 负责下载，
//! 落盘为独立的 `.part<i>` 文件（内容从文件偏移 0 开始）。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 多段下载的最小文件大小：小于 1MB 强制单连接
pub const MIN_SIZE_FOR_MULTIPART: i64 = 1024 * 1024;

/// 单个分段的最小宽度：连接数受 total/512KB 约束
pub const MIN_PART_SIZE: i64 = 512 * 1024;

/// 最大并行分段数
pub const MAX_PARALLEL_SEGMENTS: usize = 8;

/// 分段信息
///
/// `end == -1` 表示长度未知（单流下载）；区间两端均为闭区间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 起始字节（含）
    pub start: i64,
    /// 结束字节（含），-1 表示未知
    pub end: i64,
    /// 下一个待请求的字节
    pub current: i64,
    /// 是否已完成
    pub completed: bool,
}

impl Chunk {
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            current: start,
            completed: false,
        }
    }

    /// 分段长度；未知长度返回 -1
    pub fn length(&self) -> i64 {
        if self.end < 0 {
            return -1;
        }
        self.end - self.start + 1
    }

    /// 该分段已落盘的字节数
    pub fn downloaded(&self) -> i64 {
        if self.current > self.start {
            self.current - self.start
        } else {
            0
        }
    }

    /// 推进进度，`current` 越过 `end` 时自动置完成
    pub fn advance_to(&mut self, current: i64) {
        self.current = current;
        if self.end >= 0 && current > self.end {
            self.completed = true;
        }
    }
}

/// 按连接数划分分段
///
/// 等宽划分，最后一段吸收余数；`total <= 0` 或单连接时退化为一个
/// 流式分段（`end == -1` 当长度未知）
pub fn build_chunks(total_size: i64, connections: usize) -> Vec<Chunk> {
    if total_size <= 0 || connections <= 1 {
        let end = if total_size > 0 { total_size - 1 } else { -1 };
        return vec![Chunk::new(0, end)];
    }

    let connections = connections as i64;
    let chunk_size = total_size / connections;
    let mut chunks = Vec::with_capacity(connections as usize);
    let mut start = 0i64;

    for i in 0..connections {
        let end = if i == connections - 1 {
            total_size - 1
        } else {
            start + chunk_size - 1
        };
        chunks.push(Chunk::new(start, end));
        start = end + 1;
    }

    chunks
}

/// 选择连接数
///
/// 限制在 [1, 8]，再按 `total / 512KB` 收紧；小于 1MB 或大小未知的
/// 文件强制单连接
pub fn choose_connections(configured: usize, total_size: i64, range_supported: bool) -> usize {
    if total_size <= 0 || !range_supported {
        return 1;
    }
    if total_size < MIN_SIZE_FOR_MULTIPART {
        return 1;
    }

    let mut connections = configured.clamp(1, MAX_PARALLEL_SEGMENTS);
    let max_by_size = (total_size / MIN_PART_SIZE).max(1) as usize;
    if connections > max_by_size {
        connections = max_by_size;
    }
    connections
}

/// 分段对应的 `.part<i>` 文件路径
pub fn part_path(final_path: &Path, index: usize) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(format!(".part{}", index));
    PathBuf::from(name)
}

/// 与磁盘上的 `.part` 文件对账（断点续传入口）
///
/// 逐段检查：
/// - part 比分段还大 → 视为损坏，删除后该段从头开始
/// - 大小相等 → 标记完成
/// - 小于 → 从 `start + part_size` 续传
pub async fn reconcile_with_part_files(chunks: &mut [Chunk], final_path: &Path) {
    for (i, chunk) in chunks.iter_mut().enumerate() {
        let path = part_path(final_path, i);
        let part_size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len() as i64,
            Err(_) => 0,
        };
        let chunk_len = chunk.length();

        if part_size > 0 {
            if part_size > chunk_len {
                warn!(
                    "分段 #{} 的 part 文件损坏（{} > 预期 {}），删除后重新下载",
                    i, part_size, chunk_len
                );
                let _ = tokio::fs::remove_file(&path).await;
                chunk.current = chunk.start;
                chunk.completed = false;
            } else if part_size == chunk_len {
                chunk.current = chunk.end + 1;
                chunk.completed = true;
                info!("分段 #{} 已完整（{} bytes），跳过", i, part_size);
            } else {
                chunk.current = chunk.start + part_size;
                chunk.completed = false;
                info!("分段 #{} 从 {}/{} bytes 处续传", i, part_size, chunk_len);
            }
        } else {
            chunk.current = chunk.start;
            chunk.completed = false;
        }
    }
}

/// 删除所有 part 文件（降级/重建分段时调用）
pub async fn remove_part_files(final_path: &Path, count: usize) {
    for i in 0..count {
        let _ = tokio::fs::remove_file(part_path(final_path, i)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_build_chunks_coverage() {
        // 等宽覆盖 [0, total-1]，最后一段吸收余数
        let total: i64 = 10 * 1024 * 1024;
        let chunks = build_chunks(total, 4);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[3].end, total - 1);

        // 相邻段连续且不重叠
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start);
        }

        // 10MiB / 4 整除，四段等宽
        assert_eq!(chunks[0].length(), 2_621_440);
        assert_eq!(chunks[3].length(), 2_621_440);

        let sum: i64 = chunks.iter().map(|c| c.length()).sum();
        assert_eq!(sum, total);
    }

    #[test]
    fn test_build_chunks_remainder() {
        let chunks = build_chunks(105, 10);
        assert_eq!(chunks.len(), 10);
        assert_eq!(chunks[9].end, 104);
        // 余数全部进最后一段
        assert_eq!(chunks[9].length(), 15);
        let sum: i64 = chunks.iter().map(|c| c.length()).sum();
        assert_eq!(sum, 105);
    }

    #[test]
    fn test_build_chunks_single_and_unknown() {
        let chunks = build_chunks(-1, 4);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].end, -1);
        assert_eq!(chunks[0].length(), -1);

        let chunks = build_chunks(1000, 1);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].end, 999);
    }

    #[test]
    fn test_choose_connections() {
        // 未知大小或不支持 Range → 1
        assert_eq!(choose_connections(8, -1, true), 1);
        assert_eq!(choose_connections(8, 10 << 20, false), 1);
        // 小文件 → 1
        assert_eq!(choose_connections(8, 500_000, true), 1);
        // 大小上限：2MB / 512KB = 4
        assert_eq!(choose_connections(8, 2 << 20, true), 4);
        // 配置钳制到 [1, 8]
        assert_eq!(choose_connections(32, 1 << 30, true), 8);
        assert_eq!(choose_connections(0, 1 << 30, true), 1);
    }

    #[test]
    fn test_advance_auto_complete() {
        let mut chunk = Chunk::new(0, 99);
        chunk.advance_to(50);
        assert!(!chunk.completed);
        assert_eq!(chunk.downloaded(), 50);

        chunk.advance_to(100);
        assert!(chunk.completed);

        // 未知长度的流式分段永不自动完成
        let mut streaming = Chunk::new(0, -1);
        streaming.advance_to(1 << 30);
        assert!(!streaming.completed);
    }

    #[test]
    fn test_part_path() {
        let p = part_path(Path::new("/tmp/file.zip"), 3);
        assert_eq!(p, PathBuf::from("/tmp/file.zip.part3"));
    }

    #[tokio::test]
    async fn test_reconcile_with_part_files() {
        let dir = TempDir::new().unwrap();
        let final_path = dir.path().join("file.bin");

        let mut chunks = build_chunks(300, 3);

        // part0 完整，part1 一半，part2 超长（损坏）
        tokio::fs::write(part_path(&final_path, 0), vec![0u8; 100])
            .await
            .unwrap();
        tokio::fs::write(part_path(&final_path, 1), vec![0u8; 40])
            .await
            .unwrap();
        tokio::fs::write(part_path(&final_path, 2), vec![0u8; 500])
            .await
            .unwrap();

        reconcile_with_part_files(&mut chunks, &final_path).await;

        assert!(chunks[0].completed);
        assert_eq!(chunks[0].current, 100);

        assert!(!chunks[1].completed);
        assert_eq!(chunks[1].current, 100 + 40);

        // 损坏的 part 被删除，分段重置
        assert!(!chunks[2].completed);
        assert_eq!(chunks[2].current, chunks[2].start);
        assert!(tokio::fs::metadata(part_path(&final_path, 2))
            .await
            .is_err());
    }
}
