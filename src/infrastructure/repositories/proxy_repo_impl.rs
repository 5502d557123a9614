// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::models::proxy::{Proxy, ProxyStatus};
use crate::domain::repositories::job_repository::RepositoryError;
use crate::domain::repositories::proxy_repository::ProxyRepository;
use crate::infrastructure::database::entities::proxy as proxy_entity;
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

/// 代理仓库实现
///
/// 基于SeaORM实现的代理注册表数据访问层
#[derive(Clone)]
pub struct ProxyRepositoryImpl {
    /// 数据库连接
    db: Arc<DatabaseConnection>,
}

impl ProxyRepositoryImpl {
    /// 创建新的代理仓库实例
    ///
    /// # 参数
    ///
    /// * `db` - 数据库连接
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

impl From<proxy_entity::Model> for Proxy {
    fn from(model: proxy_entity::Model) -> Self {
        Self {
            id: model.id,
            host: model.host,
            port: model.port as u16,
            username: model.username,
            password: model.password,
            scheme: model.scheme.parse().unwrap_or_default(),
            country: model.country,
            provider: model.provider,
            status: model.status.parse().unwrap_or_default(),
            success_rate: model.success_rate,
            total_requests: model.total_requests,
            successful_requests: model.successful_requests,
            failed_requests: model.failed_requests,
            avg_response_ms: model.avg_response_ms,
            last_used: model.last_used,
            last_status: model.last_status,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

impl From<Proxy> for proxy_entity::ActiveModel {
    fn from(proxy: Proxy) -> Self {
        Self {
            id: Set(proxy.id),
            host: Set(proxy.host.clone()),
            port: Set(proxy.port as i32),
            username: Set(proxy.username.clone()),
            password: Set(proxy.password.clone()),
            scheme: Set(proxy.scheme.to_string()),
            country: Set(proxy.country.clone()),
            provider: Set(proxy.provider.clone()),
            status: Set(proxy.status.to_string()),
            success_rate: Set(proxy.success_rate),
            total_requests: Set(proxy.total_requests),
            successful_requests: Set(proxy.successful_requests),
            failed_requests: Set(proxy.failed_requests),
            avg_response_ms: Set(proxy.avg_response_ms),
            last_used: Set(proxy.last_used),
            last_status: Set(proxy.last_status.clone()),
            created_at: Set(proxy.created_at),
            updated_at: Set(proxy.updated_at),
        }
    }
}

#[async_trait]
impl ProxyRepository for ProxyRepositoryImpl {
    async fn find_active(&self) -> Result<Vec<Proxy>, RepositoryError> {
        let models = proxy_entity::Entity::find()
            .filter(proxy_entity::Column::Status.eq(ProxyStatus::Active.to_string()))
            .order_by_desc(proxy_entity::Column::SuccessRate)
            .all(self.db.as_ref())
            .await?;

        Ok(models.into_iter().map(Into::into).collect())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Proxy>, RepositoryError> {
        let model = proxy_entity::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?;
        Ok(model.map(Into::into))
    }

    async fn update(&self, proxy: &Proxy) -> Result<Proxy, RepositoryError> {
        let mut model: proxy_entity::ActiveModel = proxy.clone().into();
        model.updated_at = Set(Utc::now().into());

        let updated = model.update(self.db.as_ref()).await?;
        Ok(updated.into())
    }
}
