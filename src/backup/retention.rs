use chrono::{DateTime, Duration, Utc};

/// How long backups are kept and how many always survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    pub min_backups_to_keep: usize,
}

impl RetentionPolicy {
    pub fn new(retention_days: u32, min_backups_to_keep: usize) -> Self {
        Self {
            retention_days,
            min_backups_to_keep,
        }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.retention_days as i64)
    }

    /// Decide which backups survive.
    ///
    /// Every backup inside the retention window, its boundary included, is
    /// kept. Older backups are kept newest first only while the total is
    /// below `min_backups_to_keep`; the rest are deleted. Equal timestamps are
    /// ordered by id so the plan is deterministic.
    pub fn plan<'a>(
        &self,
        backups: impl IntoIterator<Item = (&'a str, DateTime<Utc>)>,
        now: DateTime<Utc>,
    ) -> RetentionPlan {
        let cutoff = self.cutoff(now);
        let mut ordered = backups.into_iter().collect::<Vec<_>>();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(a.0)));

        let (recent, older): (Vec<_>, Vec<_>) =
            ordered.into_iter().partition(|(_, created_at)| *created_at >= cutoff);

        let mut keep = recent
            .iter()
            .map(|(id, _)| id.to_string())
            .collect::<Vec<_>>();
        let room = self.min_backups_to_keep.saturating_sub(keep.len());
        keep.extend(older.iter().take(room).map(|(id, _)| id.to_string()));
        let delete = older
            .iter()
            .skip(room)
            .map(|(id, _)| id.to_string())
            .collect();

        RetentionPlan { keep, delete }
    }
}

/// Backup ids to keep and to delete, newest first in both lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    pub keep: Vec<String>,
    pub delete: Vec<String>,
}
