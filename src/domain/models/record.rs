// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 抓取结果记录
///
/// 每个成功任务产生一条记录，包含提取的字段映射、
/// 来源URL和处理元数据（时间戳、耗时、配置快照）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedRecord {
    /// 记录唯一标识符
    pub id: Uuid,
    /// 关联的任务ID
    pub job_id: Uuid,
    /// 来源URL
    pub url: String,
    /// 提取的字段数据，键为提取器名称
    pub data: serde_json::Value,
    /// 执行时的任务配置快照
    pub config_snapshot: serde_json::Value,
    /// 处理耗时（毫秒）
    pub duration_ms: i64,
    /// 截图数据（base64编码，可选）
    pub screenshot: Option<String>,
    /// 记录创建时间
    pub created_at: DateTime<Utc>,
}
