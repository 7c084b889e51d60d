//! Job orchestration.
//!
//! [`JobService`] drives a job from Pending to a terminal state. Provider
//! failures of any kind are recorded on the job rather than returned: once a
//! job has been loaded, the only errors that escape are storage errors and
//! illegal state transitions.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    config::JobsConfig,
    errors::{AppError, AppResult},
    job::{Job, JobKind, JobStatus, ProviderUsageSummary, Usage},
    notify::NotificationSink,
    providers::{AIProvider, CompletionRequest, OnChunk, ProviderRegistry},
    store::{JobStore, UsageStore},
};

pub const PROVIDER_NOT_FOUND: &str = "provider not found";
pub const PROVIDER_NOT_AVAILABLE: &str = "provider not available";
pub const NO_AVAILABLE_PROVIDERS: &str = "no available providers";

/// Job orchestration service
#[derive(Clone)]
pub struct JobService {
    jobs: Arc<dyn JobStore>,
    usage: Arc<dyn UsageStore>,
    registry: Arc<ProviderRegistry>,
    notifier: Arc<dyn NotificationSink>,
    permits: Arc<Semaphore>,
    default_providers: Vec<String>,
}

impl JobService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        usage: Arc<dyn UsageStore>,
        registry: Arc<ProviderRegistry>,
        notifier: Arc<dyn NotificationSink>,
        config: &JobsConfig,
    ) -> Self {
        Self {
            jobs,
            usage,
            registry,
            notifier,
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            default_providers: config.default_providers.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// 创建待处理任务
    ///
    /// ## 功能说明
    /// 以Pending状态持久化新任务并发布一次通知，不触发任何处理
    ///
    /// ## 返回值
    /// - `Ok(Job)`: 新创建的任务
    /// - `Err(AppError::ValidationError)`: 输入为空
    pub async fn create_job(&self, tenant_id: Uuid, kind: JobKind, input: &str) -> AppResult<Job> {
        if input.trim().is_empty() {
            return Err(AppError::ValidationError("Job input cannot be empty".to_string()));
        }

        let job = Job::new(tenant_id, kind, input);
        self.jobs.create(&job).await?;
        self.notifier.publish(&job);

        tracing::info!(job_id = %job.id, tenant_id = %tenant_id, kind = %kind, "job created");
        Ok(job)
    }

    /// 提交任务并在后台处理
    ///
    /// ## 功能说明
    /// 创建任务后为其启动一个独立的后台任务。并发处理数量受`max_concurrent_jobs`限制，
    /// 超出的任务在信号量上排队等待
    ///
    /// ## 提供商选择
    /// 1. `providers`非空：按顺序进行一次性回退选择
    /// 2. 否则使用配置中的`default_providers`
    /// 3. 两者都为空：按注册顺序选择第一个支持该类型且可用的提供商
    ///
    /// ## 返回值
    /// 新创建的任务快照，以及后台任务的句柄
    pub async fn submit_job(
        &self,
        tenant_id: Uuid,
        kind: JobKind,
        input: &str,
        providers: Vec<String>,
    ) -> AppResult<(Job, JoinHandle<()>)> {
        let job = self.create_job(tenant_id, kind, input).await?;
        let preferences = if providers.is_empty() {
            self.default_providers.clone()
        } else {
            providers
        };

        let service = self.clone();
        let job_id = job.id;
        let handle = tokio::spawn(async move {
            let _permit = match Arc::clone(&service.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "job scheduler closed");
                    return;
                }
            };

            let outcome = if preferences.is_empty() {
                service.process_with_selection(job_id, kind).await
            } else {
                service.process_job_with_fallback(job_id, &preferences).await
            };

            if let Err(e) = outcome {
                tracing::error!(job_id = %job_id, error = %e, "background job processing failed");
            }
        });

        Ok((job, handle))
    }

    /// 使用指定提供商处理任务
    ///
    /// ## 内部实现逻辑
    /// 1. 加载任务，不存在时直接返回错误，不修改任何状态
    /// 2. 提供商未注册：任务标记为失败（"provider not found"）
    /// 3. 提供商不可用：任务标记为失败（"provider not available"）
    /// 4. 标记为Processing并持久化、通知，然后再发起网络调用
    /// 5. 执行失败：错误信息写入任务，不向调用方返回错误
    /// 6. 执行成功：标记为Completed并持久化、通知
    /// 7. 写入Usage记录，失败只记录日志
    ///
    /// ## 返回值
    /// 处理结束后的任务快照
    #[tracing::instrument(skip_all, fields(job_id = %job_id, provider = %provider_name))]
    pub async fn process_job(&self, job_id: Uuid, provider_name: &str) -> AppResult<Job> {
        let job = self.jobs.get(job_id).await?;

        let Some(provider) = self.registry.get(provider_name).await else {
            tracing::warn!("provider not registered");
            return self.fail(job, PROVIDER_NOT_FOUND).await;
        };

        if !provider.is_available().await {
            tracing::warn!("provider unavailable");
            return self.fail(job, PROVIDER_NOT_AVAILABLE).await;
        }

        self.dispatch(job, provider).await
    }

    /// 按顺序回退选择提供商处理任务
    ///
    /// ## 功能说明
    /// 依次检查每个名称，第一个已注册且可用的提供商负责处理；每个名称只检查一次，
    /// 不对同一提供商重试。选中提供商之后的名称不会再被探测
    ///
    /// ## 返回值
    /// - 没有合格的提供商：任务标记为失败（"no available providers"）
    pub async fn process_job_with_fallback(
        &self,
        job_id: Uuid,
        provider_names: &[String],
    ) -> AppResult<Job> {
        let job = self.jobs.get(job_id).await?;

        for name in provider_names {
            let Some(provider) = self.registry.get(name).await else {
                tracing::debug!(job_id = %job_id, provider = %name, "fallback: provider not registered");
                continue;
            };
            if !provider.is_available().await {
                tracing::debug!(job_id = %job_id, provider = %name, "fallback: provider unavailable");
                continue;
            }
            return self.dispatch(job, provider).await;
        }

        tracing::warn!(job_id = %job_id, candidates = ?provider_names, "no provider in fallback list is usable");
        self.fail(job, NO_AVAILABLE_PROVIDERS).await
    }

    async fn process_with_selection(&self, job_id: Uuid, kind: JobKind) -> AppResult<Job> {
        match self.registry.select_for_kind(kind).await {
            Ok(provider) => {
                let job = self.jobs.get(job_id).await?;
                self.dispatch(job, provider).await
            }
            Err(AppError::NoProviderAvailable) => {
                let job = self.jobs.get(job_id).await?;
                self.fail(job, NO_AVAILABLE_PROVIDERS).await
            }
            Err(e) => Err(e),
        }
    }

    /// Mark processing, execute, then record the outcome on the job.
    async fn dispatch(&self, mut job: Job, provider: Arc<dyn AIProvider>) -> AppResult<Job> {
        job.mark_processing(provider.name())?;
        self.persist(&job, JobStatus::Pending).await?;
        tracing::info!(job_id = %job.id, provider = %provider.name(), "job processing");

        match provider.execute(&job).await {
            Ok(result) => {
                job.mark_completed(&result.content, result.tokens_in, result.tokens_out, result.cost)?;
                self.persist(&job, JobStatus::Processing).await?;
                tracing::info!(
                    job_id = %job.id,
                    provider = %provider.name(),
                    tokens_in = job.tokens_in,
                    tokens_out = job.tokens_out,
                    cost = job.cost,
                    "job completed"
                );
                self.record_usage(&job, &result.model).await;
                Ok(job)
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, provider = %provider.name(), error = %e, "provider execution failed");
                self.fail(job, e.to_string()).await
            }
        }
    }

    /// 以流式方式处理文本任务
    ///
    /// ## 功能说明
    /// 提供商具备流式能力时逐块回调`on_chunk`，否则退回到阻塞式`execute`。
    /// 流中途出错（包括已输出部分内容之后）或被取消时，任务标记为失败
    pub async fn stream_job(
        &self,
        job_id: Uuid,
        provider_name: &str,
        cancel: CancellationToken,
        on_chunk: &mut OnChunk<'_>,
    ) -> AppResult<Job> {
        let mut job = self.jobs.get(job_id).await?;

        let Some(provider) = self.registry.get(provider_name).await else {
            return self.fail(job, PROVIDER_NOT_FOUND).await;
        };
        if !provider.is_available().await {
            return self.fail(job, PROVIDER_NOT_AVAILABLE).await;
        }

        let streaming = match provider.as_streaming() {
            Some(streaming) if job.kind == JobKind::Text => streaming,
            _ => {
                tracing::debug!(job_id = %job.id, provider = %provider_name, "no streaming capability, executing");
                return self.dispatch(job, Arc::clone(&provider)).await;
            }
        };

        job.mark_processing(provider.name())?;
        self.persist(&job, JobStatus::Pending).await?;

        let request = CompletionRequest::from_prompt(job.input.clone());
        match streaming.complete_stream(request, cancel, on_chunk).await {
            Ok(response) => {
                job.mark_completed(
                    &response.content,
                    response.tokens_in,
                    response.tokens_out,
                    response.cost,
                )?;
                self.persist(&job, JobStatus::Processing).await?;
                tracing::info!(
                    job_id = %job.id,
                    provider = %provider_name,
                    tool_calls = response.tool_calls.len(),
                    "streamed job completed"
                );
                self.record_usage(&job, &response.model).await;
                Ok(job)
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, provider = %provider_name, error = %e, "stream failed");
                self.fail(job, e.to_string()).await
            }
        }
    }

    /// Cancel a Pending job owned by `tenant_id`. Any other status is an
    /// error and leaves the job untouched.
    pub async fn cancel_job(&self, tenant_id: Uuid, job_id: Uuid) -> AppResult<Job> {
        let mut job = self.jobs.get_for_tenant(tenant_id, job_id).await?;
        job.cancel()?;
        self.persist(&job, JobStatus::Pending).await?;
        tracing::info!(job_id = %job_id, tenant_id = %tenant_id, "job cancelled");
        Ok(job)
    }

    pub async fn get_job(&self, tenant_id: Uuid, job_id: Uuid) -> AppResult<Job> {
        self.jobs.get_for_tenant(tenant_id, job_id).await
    }

    pub async fn list_jobs(&self, tenant_id: Uuid) -> AppResult<Vec<Job>> {
        self.jobs.list_by_tenant(tenant_id).await
    }

    pub async fn count_jobs(&self, tenant_id: Uuid) -> AppResult<u64> {
        self.jobs.count_by_tenant(tenant_id).await
    }

    pub async fn usage_summary(&self, tenant_id: Uuid) -> AppResult<Vec<ProviderUsageSummary>> {
        self.usage.summary_by_provider(tenant_id).await
    }

    pub async fn job_usage(&self, job_id: Uuid) -> AppResult<Vec<Usage>> {
        self.usage.list_by_job(job_id).await
    }

    async fn fail(&self, mut job: Job, message: impl Into<String>) -> AppResult<Job> {
        let from = job.status;
        job.mark_failed(message)?;
        self.persist(&job, from).await?;
        tracing::info!(job_id = %job.id, error = ?job.error, "job failed");
        Ok(job)
    }

    /// Store then publish; the publish never blocks. The store write only
    /// lands while the stored status is still `from`.
    async fn persist(&self, job: &Job, from: JobStatus) -> AppResult<()> {
        self.jobs.update(job, from).await?;
        self.notifier.publish(job);
        Ok(())
    }

    async fn record_usage(&self, job: &Job, model: &str) {
        let usage = Usage::for_job(job, model);
        if let Err(e) = self.usage.create(&usage).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to record usage");
        }
    }
}
