// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::proxy::Proxy;
use crate::domain::repositories::job_repository::RepositoryError;
use async_trait::async_trait;
use uuid::Uuid;

/// 代理仓库特质
///
/// 定义代理注册表的数据访问接口
#[async_trait]
pub trait ProxyRepository: Send + Sync {
    /// 查找所有活跃代理，按成功率降序排列
    async fn find_active(&self) -> Result<Vec<Proxy>, RepositoryError>;
    /// 根据ID查找代理
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Proxy>, RepositoryError>;
    /// 更新代理（可靠性计数器读-改-写的写入端）
    async fn update(&self, proxy: &Proxy) -> Result<Proxy, RepositoryError>;
}
