//! Exit-code contract shared between the worker process and the Scheduler
//! that interprets it.

/// Process exit codes a Worker may use, and the only codes the Scheduler
/// gives a specific meaning to. Anything else is classified `FAILED`.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const SEGFAULT: i32 = 11;
}

/// The five-token argv contract a worker is invoked with:
/// `exec_path job_id user_id db_conn_string memory_limit_bytes`.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub job_id: i64,
    pub user_id: i64,
    pub db_conn_string: String,
    pub memory_limit_bytes: u64,
}

impl WorkerArgs {
    /// Builds the argv (excluding argv\[0\], the executable path itself).
    pub fn to_argv(&self) -> Vec<String> {
        vec![
            self.job_id.to_string(),
            self.user_id.to_string(),
            self.db_conn_string.clone(),
            self.memory_limit_bytes.to_string(),
        ]
    }

    /// Parses argv\[1..\] (i.e. `std::env::args().skip(1)`) back into a
    /// `WorkerArgs`. A malformed argv is a hard error: the worker must exit
    /// 1 rather than run with incomplete arguments.
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Option<Self> {
        let tokens: Vec<String> = args.into_iter().collect();
        if tokens.len() != 4 {
            return None;
        }
        Some(WorkerArgs {
            job_id: tokens[0].parse().ok()?,
            user_id: tokens[1].parse().ok()?,
            db_conn_string: tokens[2].clone(),
            memory_limit_bytes: tokens[3].parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_argv() {
        let args = WorkerArgs {
            job_id: 7,
            user_id: 3,
            db_conn_string: "postgres://u:p@h/db".to_owned(),
            memory_limit_bytes: 1 << 30,
        };
        let argv = args.to_argv();
        let parsed = WorkerArgs::parse(argv).unwrap();
        assert_eq!(parsed.job_id, 7);
        assert_eq!(parsed.user_id, 3);
        assert_eq!(parsed.memory_limit_bytes, 1 << 30);
    }

    #[test]
    fn rejects_wrong_token_count() {
        assert!(WorkerArgs::parse(vec!["1".to_owned()]).is_none());
        assert!(WorkerArgs::parse(Vec::<String>::new()).is_none());
    }

    #[test]
    fn rejects_non_numeric_tokens() {
        let tokens = vec![
            "not-a-number".to_owned(),
            "2".to_owned(),
            "conn".to_owned(),
            "0".to_owned(),
        ];
        assert!(WorkerArgs::parse(tokens).is_none());
    }
}
