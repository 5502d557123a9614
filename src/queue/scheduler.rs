// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

use crate::domain::repositories::job_repository::JobRepository;
use chrono::Duration;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration as TokioDuration};
use tracing::{error, info};

/// 任务调度器
///
/// 负责队列的周期性维护：重置锁已过期但仍标记为运行中的
/// 任务，让崩溃的工作器不会永久搁置任务。
/// 实际的任务调度（获取任务）由Worker通过acquire_next主动拉取。
pub struct JobScheduler<R: JobRepository + Send + Sync + 'static> {
    /// 任务仓库
    repository: Arc<R>,
}

impl<R: JobRepository + Send + Sync + 'static> JobScheduler<R> {
    /// 创建新的任务调度器实例
    ///
    /// # 参数
    ///
    /// * `repository` - 任务仓库
    ///
    /// # 返回值
    ///
    /// 返回新的任务调度器实例
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }

    /// 启动调度器后台任务
    ///
    /// # 返回值
    ///
    /// 返回后台任务的句柄
    pub fn start(&self) -> JoinHandle<()> {
        let repository = self.repository.clone();

        tokio::spawn(async move {
            let mut interval = interval(TokioDuration::from_secs(60));

            loop {
                interval.tick().await;

                match repository.reset_stuck_jobs(Duration::minutes(30)).await {
                    Ok(count) => {
                        if count > 0 {
                            info!("Reset {} stuck jobs", count);
                        }
                    }
                    Err(e) => {
                        error!("Failed to reset stuck jobs: {}", e);
                    }
                }
            }
        })
    }
}
