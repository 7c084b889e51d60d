use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

/// Error recorded on a job cancelled by its owner.
pub const CANCELLED_BY_USER: &str = "cancelled by user";

/// Kind of output a job asks for
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Text,
    Image,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Text => f.write_str("text"),
            JobKind::Image => f.write_str("image"),
        }
    }
}

/// Lifecycle state of a job
///
/// `Pending -> Processing -> {Completed, Failed}`; `Pending -> Failed` is
/// allowed too. Nothing leaves a terminal state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One request for generated text or image output
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub input: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub provider: Option<String>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// 创建新的待处理任务
    ///
    /// ## 功能说明
    /// 以Pending状态创建任务，结果、错误和计费字段均为空
    ///
    /// ## 执行例子
    /// ```rust,ignore
    /// let job = Job::new(tenant_id, JobKind::Text, "Hello");
    /// assert_eq!(job.status, JobStatus::Pending);
    /// ```
    pub fn new(tenant_id: Uuid, kind: JobKind, input: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            kind,
            status: JobStatus::Pending,
            input: input.into(),
            result: None,
            error: None,
            provider: None,
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// 标记任务开始处理
    ///
    /// ## 功能说明
    /// 仅允许从Pending状态转换，记录处理该任务的提供商名称和开始时间
    ///
    /// ## 返回值
    /// - `Ok(())`: 状态转换成功
    /// - `Err(AppError::InvalidTransition)`: 当前状态不是Pending
    pub fn mark_processing(&mut self, provider: impl Into<String>) -> AppResult<()> {
        if self.status != JobStatus::Pending {
            return Err(self.invalid("start"));
        }

        let now = Utc::now();
        self.status = JobStatus::Processing;
        self.provider = Some(provider.into());
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// 标记任务成功完成
    ///
    /// ## 功能说明
    /// 仅允许从Processing状态转换，写入结果与计费字段并清除之前的错误
    ///
    /// ## 参数说明
    /// - `result`: 生成的文本或图片地址
    /// - `tokens_in` / `tokens_out`: 输入/输出token数量
    /// - `cost`: 本次调用的费用，负数会被截断为0
    pub fn mark_completed(
        &mut self,
        result: impl Into<String>,
        tokens_in: u32,
        tokens_out: u32,
        cost: f64,
    ) -> AppResult<()> {
        if self.status != JobStatus::Processing {
            return Err(self.invalid("complete"));
        }

        let now = Utc::now();
        self.status = JobStatus::Completed;
        self.result = Some(result.into());
        self.error = None;
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self.cost = cost.max(0.0);
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// 标记任务失败
    ///
    /// ## 功能说明
    /// 允许从Pending或Processing状态转换，记录错误信息和结束时间，计费字段保持不变
    pub fn mark_failed(&mut self, message: impl Into<String>) -> AppResult<()> {
        if self.status.is_terminal() {
            return Err(self.invalid("fail"));
        }

        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.result = None;
        self.error = Some(message.into());
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Cancel a job that has not started yet.
    pub fn cancel(&mut self) -> AppResult<()> {
        if self.status != JobStatus::Pending {
            return Err(self.invalid("cancel"));
        }
        self.mark_failed(CANCELLED_BY_USER)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn invalid(&self, action: &'static str) -> AppError {
        AppError::InvalidTransition {
            from: self.status,
            action,
        }
    }
}

/// Immutable accounting record for one completed job
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Usage {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_id: Uuid,
    pub provider: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
}

impl Usage {
    /// Build the usage row for a completed job.
    pub fn for_job(job: &Job, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: job.tenant_id,
            job_id: job.id,
            provider: job.provider.clone().unwrap_or_default(),
            model: model.into(),
            tokens_in: job.tokens_in,
            tokens_out: job.tokens_out,
            cost: job.cost,
            created_at: Utc::now(),
        }
    }
}

/// Per-provider usage totals for one tenant
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ProviderUsageSummary {
    pub provider: String,
    pub jobs: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost: f64,
}
