use std::fmt;

use drudge::job::JobId;
use redis::{RedisWrite, ToRedisArgs};

/// Prefix shared by every key a backend touches.
#[derive(Debug, Clone)]
pub(crate) struct NameSpace(pub(crate) String);

impl NameSpace {
    fn key<'a>(&'a self, kind: KeyType<'a>) -> NameSpacedKey<'a> {
        NameSpacedKey {
            namespace: &self.0,
            kind,
        }
    }

    pub(crate) fn id_counter(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::IdCounter)
    }

    pub(crate) fn job(&self, id: JobId) -> NameSpacedKey<'_> {
        self.key(KeyType::Job(Some(id)))
    }

    /// Job hash keys without the id, for scripts that derive keys from set members.
    pub(crate) fn job_prefix(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::Job(None))
    }

    pub(crate) fn pending<'a>(&'a self, queue: &'a str) -> NameSpacedKey<'a> {
        self.key(KeyType::Pending(queue))
    }

    pub(crate) fn reserved<'a>(&'a self, queue: &'a str) -> NameSpacedKey<'a> {
        self.key(KeyType::Reserved(queue))
    }

    pub(crate) fn failed_set(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::FailedSet)
    }

    pub(crate) fn failed(&self, id: JobId) -> NameSpacedKey<'_> {
        self.key(KeyType::Failed(Some(id)))
    }

    pub(crate) fn failed_prefix(&self) -> NameSpacedKey<'_> {
        self.key(KeyType::Failed(None))
    }
}

pub(crate) struct NameSpacedKey<'a> {
    namespace: &'a str,
    kind: KeyType<'a>,
}

enum KeyType<'a> {
    IdCounter,
    Job(Option<JobId>),
    Pending(&'a str),
    Reserved(&'a str),
    FailedSet,
    Failed(Option<JobId>),
}

impl fmt::Display for NameSpacedKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.namespace)?;
        match &self.kind {
            KeyType::IdCounter => write!(f, ":id_counter"),
            KeyType::Job(Some(id)) => write!(f, ":job:{id}"),
            KeyType::Job(None) => write!(f, ":job:"),
            KeyType::Pending(queue) => write!(f, ":queue:{queue}"),
            KeyType::Reserved(queue) => write!(f, ":reserved:{queue}"),
            KeyType::FailedSet => write!(f, ":failed"),
            KeyType::Failed(Some(id)) => write!(f, ":failed:{id}"),
            KeyType::Failed(None) => write!(f, ":failed:"),
        }
    }
}

impl ToRedisArgs for NameSpacedKey<'_> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        out.write_arg_fmt(self);
    }
}

/// The sorted set member for a job.
///
/// Ids are zero padded so that members with equal scores sort by id.
pub(crate) fn member(id: JobId) -> String {
    format!("{:020}", i64::from(id))
}

pub(crate) fn parse_member(member: &str) -> Option<JobId> {
    member.parse::<i64>().ok().map(JobId::from)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let ns = NameSpace("app".to_owned());
        let id = JobId::from(42);

        assert_eq!(ns.id_counter().to_string(), "app:id_counter");
        assert_eq!(ns.job(id).to_string(), "app:job:42");
        assert_eq!(ns.job_prefix().to_string(), "app:job:");
        assert_eq!(ns.pending("mail").to_string(), "app:queue:mail");
        assert_eq!(ns.reserved("mail").to_string(), "app:reserved:mail");
        assert_eq!(ns.failed_set().to_string(), "app:failed");
        assert_eq!(ns.failed(id).to_string(), "app:failed:42");
    }

    #[test]
    fn members_sort_by_id() {
        let mut members = vec![member(JobId::from(10)), member(JobId::from(9))];
        members.sort();

        assert_eq!(members, vec![member(JobId::from(9)), member(JobId::from(10))]);
        assert_eq!(parse_member(&member(JobId::from(10))), Some(JobId::from(10)));
    }
}
