//! Producer side of the queues.

use metrics::counter;

use super::job::{EnqueuedJob, QueuedJob};
use crate::common::rds::{scripts, KeySpace, RedisPool};
use crate::common::utils::now_unix;
use crate::common::Parameters;
use crate::error::{JobServiceError, Result};

/// Pushes jobs to `jobs:<type>` or `scheduled`.
///
/// The `push*` variants take a job built by the caller so its ID can be used before the
/// push; the `enqueue*` variants build the job themselves.
#[derive(Clone)]
pub struct Enqueuer {
    keys: KeySpace,
    redis: RedisPool,
}

impl Enqueuer {
    pub fn new(keys: KeySpace, redis: RedisPool) -> Self {
        Self { keys, redis }
    }

    pub async fn enqueue(&self, name: &str, args: Parameters) -> Result<EnqueuedJob> {
        let job = QueuedJob::new(name, args);
        self.push(&job).await?;
        Ok(EnqueuedJob::from(&job))
    }

    /// Enqueue unless a job with identical name and arguments is queued or running.
    pub async fn enqueue_unique(&self, name: &str, args: Parameters) -> Result<EnqueuedJob> {
        let mut job = QueuedJob::new(name, args);
        self.push_unique(&mut job).await?;
        Ok(EnqueuedJob::from(&job))
    }

    pub async fn enqueue_in(
        &self,
        name: &str,
        delay_secs: i64,
        args: Parameters,
    ) -> Result<EnqueuedJob> {
        let job = QueuedJob::new(name, args);
        let run_at = now_unix() + delay_secs.max(0);
        self.push_in(&job, run_at).await?;
        Ok(EnqueuedJob {
            run_at: Some(run_at),
            ..EnqueuedJob::from(&job)
        })
    }

    pub async fn enqueue_unique_in(
        &self,
        name: &str,
        delay_secs: i64,
        args: Parameters,
    ) -> Result<EnqueuedJob> {
        let mut job = QueuedJob::new(name, args);
        let run_at = now_unix() + delay_secs.max(0);
        self.push_unique_in(&mut job, run_at).await?;
        Ok(EnqueuedJob {
            run_at: Some(run_at),
            ..EnqueuedJob::from(&job)
        })
    }

    pub async fn push(&self, job: &QueuedJob) -> Result<()> {
        let raw = job.to_json()?;
        let mut conn = self.redis.conn();
        redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(self.keys.known_jobs())
            .arg(&job.name)
            .ignore()
            .cmd("LPUSH")
            .arg(self.keys.jobs(&job.name))
            .arg(raw)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        record(job, "generic");
        Ok(())
    }

    /// Push holding the dedup key; Conflict when it is taken.
    pub async fn push_unique(&self, job: &mut QueuedJob) -> Result<()> {
        let unique_key = job.make_unique(&self.keys);
        let raw = job.to_json()?;
        let mut conn = self.redis.conn();
        self.add_known(&mut conn, &job.name).await?;

        let reply: String = scripts::enqueue_unique()
            .key(self.keys.jobs(&job.name))
            .key(unique_key)
            .arg(raw)
            .invoke_async(&mut conn)
            .await?;
        if reply == scripts::REPLY_DUPLICATE {
            return Err(JobServiceError::unique_conflict(job.name.as_str()));
        }
        record(job, "generic");
        Ok(())
    }

    pub async fn push_in(&self, job: &QueuedJob, run_at: i64) -> Result<()> {
        let raw = job.to_json()?;
        let mut conn = self.redis.conn();
        redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(self.keys.known_jobs())
            .arg(&job.name)
            .ignore()
            .cmd("ZADD")
            .arg(self.keys.scheduled())
            .arg(run_at)
            .arg(raw)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        record(job, "scheduled");
        Ok(())
    }

    pub async fn push_unique_in(&self, job: &mut QueuedJob, run_at: i64) -> Result<()> {
        let unique_key = job.make_unique(&self.keys);
        let raw = job.to_json()?;
        let mut conn = self.redis.conn();
        self.add_known(&mut conn, &job.name).await?;

        let reply: String = scripts::enqueue_unique_in()
            .key(self.keys.scheduled())
            .key(unique_key)
            .arg(raw)
            .arg(run_at)
            .invoke_async(&mut conn)
            .await?;
        if reply == scripts::REPLY_DUPLICATE {
            return Err(JobServiceError::unique_conflict(job.name.as_str()));
        }
        record(job, "scheduled");
        Ok(())
    }

    async fn add_known(&self, conn: &mut redis::aio::ConnectionManager, name: &str) -> Result<()> {
        redis::cmd("SADD")
            .arg(self.keys.known_jobs())
            .arg(name)
            .query_async::<_, i64>(conn)
            .await?;
        Ok(())
    }
}

fn record(job: &QueuedJob, kind: &'static str) {
    tracing::debug!(
        job_id = %job.id,
        job_name = %job.name,
        kind,
        unique = job.unique,
        "Job enqueued"
    );
    counter!(
        "jobservice_jobs_enqueued_total",
        "job_name" => job.name.clone(),
        "kind" => kind,
    )
    .increment(1);
}
