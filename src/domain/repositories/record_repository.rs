// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::record::ScrapedRecord;
use crate::domain::repositories::job_repository::RepositoryError;
use async_trait::async_trait;

/// 结果记录仓库特质
#[async_trait]
pub trait RecordRepository: Send + Sync {
    /// 保存一条抓取结果记录
    async fn save(&self, record: ScrapedRecord) -> Result<(), RepositoryError>;
}
