/// Retry delay calculation for batch operations
pub(crate) mod retry_config {
    use std::time::Duration;

    /// Calculate retry delay with exponential backoff
    ///
    /// # Arguments
    /// * `attempt` - The retry attempt number (0-based)
    /// * `initial` - Initial delay duration
    /// * `max` - Maximum delay duration
    ///
    /// # Returns
    /// Duration to wait before retrying
    pub(crate) fn retry_delay(attempt: usize, initial: Duration, max: Duration) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(u32::MAX as usize) as u32);
        let delay_ms = (initial.as_millis() as u64).saturating_mul(factor);
        let capped_delay = delay_ms.min(max.as_millis() as u64);
        Duration::from_millis(capped_delay)
    }

    /// Calculate retry delay growing linearly with the attempt number (1-based)
    pub(crate) fn linear_delay(attempt: usize, initial: Duration, max: Duration) -> Duration {
        let delay_ms = (initial.as_millis() as u64).saturating_mul(attempt as u64);
        let capped_delay = delay_ms.min(max.as_millis() as u64);
        Duration::from_millis(capped_delay)
    }
}

/// Order-preserving chunking
pub(crate) mod partition {
    use crate::Error;

    /// Split `items` into consecutive chunks of `size` elements
    ///
    /// Every chunk but the last holds exactly `size` items and concatenating the
    /// chunks reproduces `items`. A zero `size` is rejected.
    pub fn partition<T>(items: Vec<T>, size: usize) -> Result<Vec<Vec<T>>, Error> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "partition size must be greater than zero".to_string(),
            ));
        }

        let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
        let mut items = items.into_iter();
        loop {
            let chunk: Vec<T> = items.by_ref().take(size).collect();
            if chunk.is_empty() {
                break;
            }
            chunks.push(chunk);
        }

        Ok(chunks)
    }
}

/// Batch sizing from estimated item size
pub(crate) mod capacity {
    use super::batch_processor::BATCH_WRITE_SIZE;

    /// Largest request payload BatchWriteItem accepts
    pub const MAX_BATCH_PAYLOAD_BYTES: i64 = 400 * 1024;

    /// Share of the payload ceiling a computed batch may fill
    pub const PAYLOAD_SAFETY_FACTOR: f64 = 0.8;

    /// Items per batch that keep the request under 80% of the payload ceiling
    ///
    /// Unknown sizes (zero or negative estimates) fall back to
    /// `min(max_batch_size, 25)`. The result is always within
    /// `[1, max_batch_size]`; a `max_batch_size` of zero is treated as one.
    pub fn optimal_batch_size(estimated_item_size_bytes: i64, max_batch_size: usize) -> usize {
        let max_batch_size = max_batch_size.max(1);

        if estimated_item_size_bytes <= 0 {
            return max_batch_size.min(BATCH_WRITE_SIZE);
        }

        let safety_bytes = (MAX_BATCH_PAYLOAD_BYTES as f64 * PAYLOAD_SAFETY_FACTOR) as i64;
        let calculated = safety_bytes / estimated_item_size_bytes;

        usize::try_from(calculated)
            .unwrap_or(usize::MAX)
            .clamp(1, max_batch_size)
    }
}

/// Batch processing utilities
pub(crate) mod batch_processor {
    use futures_util::StreamExt;
    use std::{cmp, future::Future};
    use tokio_stream::{self as stream};

    use super::partition::partition;
    use crate::Error;

    /// Chunks a collection and runs one future per chunk with bounded concurrency
    #[derive(Debug)]
    pub(crate) struct BatchProcessor {
        chunk_size: usize,
        concurrency: usize,
    }

    impl BatchProcessor {
        pub(crate) fn new(chunk_size: usize, concurrency: usize) -> Self {
            Self {
                chunk_size,
                concurrency,
            }
        }

        /// Process items in chunks, folding every chunk outcome into `output`
        ///
        /// Chunk futures are infallible; failures must be carried in `R` so one
        /// chunk cannot abort the others. Completion order is unspecified.
        pub(crate) async fn process<T, R, F, Fut, O, M>(
            &self,
            items: Vec<T>,
            operation: F,
            output: O,
            merge_results: M,
        ) -> Result<O, Error>
        where
            F: Fn(Vec<T>) -> Fut,
            Fut: Future<Output = R>,
            M: Fn(&mut O, R),
        {
            if items.is_empty() {
                return Ok(output);
            }

            let batches = partition(items, self.chunk_size)?;
            let concurrency = cmp::max(1, batches.len().min(self.concurrency));

            let output = stream::iter(batches.into_iter().map(operation))
                .buffer_unordered(concurrency)
                .fold(output, |mut acc, result| {
                    merge_results(&mut acc, result);
                    async move { acc }
                })
                .await;

            Ok(output)
        }
    }

    /// Standard batch sizes for DynamoDB operations
    pub(crate) const BATCH_WRITE_SIZE: usize = 25;
    pub(crate) const BATCH_READ_SIZE: usize = 100;
    pub(crate) const DEFAULT_CONCURRENCY: usize = 10;
}

/// Key values, key attribute names and composed sort keys
pub(crate) mod keys {
    use std::fmt;

    use crate::Error;
    use crate::table::DynamoTable;

    /// Longest key value accepted, in bytes (DynamoDB's partition key limit)
    pub const MAX_KEY_LENGTH: usize = 2048;

    /// Separator placed between the parts of a composed sort key
    pub const SORT_KEY_SEPARATOR: &str = "#";

    /// True when `key` can be stored as a key value
    ///
    /// Rejects empty or blank values, values longer than [`MAX_KEY_LENGTH`]
    /// bytes, NUL characters and leading or trailing whitespace.
    pub fn is_valid_key(key: &str) -> bool {
        !key.trim().is_empty()
            && key.len() <= MAX_KEY_LENGTH
            && !key.contains('\0')
            && key.trim() == key
    }

    /// Join the non-blank, trimmed `components` with [`SORT_KEY_SEPARATOR`]
    ///
    /// ```
    /// use dynamo_batch::table::compose_sort_key;
    ///
    /// assert_eq!(compose_sort_key(["2024-05-01", " ", " seoul "]), "2024-05-01#seoul");
    /// ```
    pub fn compose_sort_key<I, S>(components: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        components
            .into_iter()
            .filter_map(|component| {
                let component = component.as_ref().trim();
                (!component.is_empty()).then(|| component.to_string())
            })
            .collect::<Vec<_>>()
            .join(SORT_KEY_SEPARATOR)
    }

    /// True when `word` is a DynamoDB reserved word (case-insensitive)
    ///
    /// Reserved words cannot appear bare in expressions; the expression
    /// builders always go through `#name` placeholders.
    pub fn is_reserved_word(word: &str) -> bool {
        let word = word.to_ascii_lowercase();
        RESERVED_WORDS.binary_search(&word.as_str()).is_ok()
    }

    /// Check the key attribute names `T` declares
    ///
    /// Empty names are rejected. Reserved names are allowed because every
    /// request built here refers to attributes through placeholders or maps,
    /// but they are logged since hand-written expressions would break on them.
    pub(crate) fn validate_table_keys<T: DynamoTable>() -> Result<(), Error> {
        let names = [Some(T::PARTITION_KEY), T::SORT_KEY, T::SOFT_DELETE_FIELD];
        for name in names.into_iter().flatten() {
            if name.trim().is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "table '{}' declares an empty key attribute name",
                    T::TABLE
                )));
            }
            if is_reserved_word(name) {
                tracing::debug!(
                    table = T::TABLE,
                    attribute = name,
                    "key attribute is a reserved word"
                );
            }
        }
        Ok(())
    }

    /// Check the key values of every item before any request is sent
    pub(crate) fn validate_item_keys<T: DynamoTable>(items: &[T]) -> Result<(), Error> {
        items.iter().try_for_each(|item| {
            validate_key_values::<T>(&item.partition_key(), item.sort_key().as_ref())
        })
    }

    /// Check one partition key and optional sort key value
    pub(crate) fn validate_key_values<T: DynamoTable>(
        partition_key: &T::PK,
        sort_key: Option<&T::SK>,
    ) -> Result<(), Error> {
        check_value(T::TABLE, T::PARTITION_KEY, partition_key)?;
        if let (Some(name), Some(value)) = (T::SORT_KEY, sort_key) {
            check_value(T::TABLE, name, value)?;
        }
        Ok(())
    }

    fn check_value(table: &str, attribute: &str, value: &impl fmt::Display) -> Result<(), Error> {
        let value = value.to_string();
        if is_valid_key(&value) {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "invalid value {value:?} for key '{attribute}' of table '{table}'"
            )))
        }
    }

    // https://docs.aws.amazon.com/amazondynamodb/latest/developerguide/ReservedWords.html
    #[rustfmt::skip]
    const RESERVED_WORDS: &[&str] = &[
    "abort", "absolute", "action", "add", "after", "agent", "aggregate", "all", "allocate",
    "alter", "analyze", "and", "any", "archive", "are", "array", "as", "asc", "ascii",
    "asensitive", "assertion", "asymmetric", "at", "atomic", "attach", "attribute", "auth",
    "authorization", "authorize", "auto", "avg", "back", "backup", "base", "batch", "before",
    "begin", "between", "bigint", "binary", "bit", "blob", "block", "boolean", "both", "breadth",
    "bucket", "bulk", "by", "byte", "call", "called", "calling", "capacity", "cascade",
    "cascaded", "case", "cast", "catalog", "char", "character", "check", "class", "clob", "close",
    "cluster", "clustered", "clustering", "clusters", "coalesce", "collate", "collation",
    "collection", "column", "columns", "combine", "comment", "commit", "compact", "compile",
    "compress", "condition", "conflict", "connect", "connection", "consistency", "consistent",
    "constraint", "constraints", "constructor", "consumed", "continue", "convert", "copy",
    "corresponding", "count", "counter", "create", "cross", "cube", "current", "cursor", "cycle",
    "data", "database", "date", "datetime", "day", "deallocate", "dec", "decimal", "declare",
    "default", "deferrable", "deferred", "define", "defined", "definition", "delete", "delimited",
    "depth", "deref", "desc", "describe", "descriptor", "detach", "deterministic", "diagnostics",
    "directories", "disable", "disconnect", "distinct", "distribute", "do", "domain", "double",
    "drop", "dump", "duration", "dynamic", "each", "element", "else", "elseif", "empty", "enable",
    "end", "equal", "equals", "error", "escape", "escaped", "eval", "evaluate", "exceeded",
    "except", "exception", "exceptions", "exclusive", "exec", "execute", "exists", "exit",
    "explain", "explode", "export", "expression", "extended", "external", "extract", "fail",
    "false", "family", "fetch", "fields", "file", "filter", "filtering", "final", "finish",
    "first", "fixed", "flattern", "float", "for", "force", "foreign", "format", "forward",
    "found", "free", "from", "full", "function", "functions", "general", "generate", "get",
    "glob", "global", "go", "goto", "grant", "greater", "group", "grouping", "handler", "hash",
    "have", "having", "heap", "hidden", "hold", "hour", "identified", "identity", "if", "ignore",
    "immediate", "import", "in", "including", "inclusive", "increment", "incremental", "index",
    "indexed", "indexes", "indicator", "infinite", "initially", "inline", "inner", "innter",
    "inout", "input", "insensitive", "insert", "instead", "int", "integer", "intersect",
    "interval", "into", "invalidate", "is", "isolation", "item", "items", "iterate", "join",
    "key", "keys", "lag", "language", "large", "last", "lateral", "lead", "leading", "leave",
    "left", "length", "less", "level", "like", "limit", "limited", "lines", "list", "load",
    "local", "localtime", "localtimestamp", "location", "locator", "lock", "locks", "log",
    "loged", "long", "loop", "lower", "map", "match", "materialized", "max", "maxlen", "member",
    "merge", "method", "metrics", "min", "minus", "minute", "missing", "mod", "mode", "modifies",
    "modify", "module", "month", "multi", "multiset", "name", "names", "national", "natural",
    "nchar", "nclob", "new", "next", "no", "none", "not", "null", "nullif", "number", "numeric",
    "object", "of", "offline", "offset", "old", "on", "online", "only", "opaque", "open",
    "operator", "option", "or", "order", "ordinality", "other", "others", "out", "outer",
    "output", "over", "overlaps", "override", "owner", "pad", "parallel", "parameter",
    "parameters", "partial", "partition", "partitioned", "partitions", "path", "percent",
    "percentile", "permission", "permissions", "pipe", "pipelined", "plan", "pool", "position",
    "precision", "prepare", "preserve", "primary", "prior", "private", "privileges", "procedure",
    "processed", "project", "projection", "property", "provisioning", "public", "put", "query",
    "quit", "quorum", "raise", "random", "range", "rank", "raw", "read", "reads", "real",
    "rebuild", "record", "recursive", "reduce", "ref", "reference", "references", "referencing",
    "regexp", "region", "reindex", "relative", "release", "remainder", "rename", "repeat",
    "replace", "request", "reset", "resignal", "resource", "response", "restore", "restrict",
    "result", "return", "returning", "returns", "reverse", "revoke", "right", "role", "roles",
    "rollback", "rollup", "routine", "row", "rows", "rule", "rules", "sample", "satisfies",
    "save", "savepoint", "scan", "schema", "scope", "scroll", "search", "second", "section",
    "segment", "segments", "select", "self", "semi", "sensitive", "separate", "sequence",
    "serializable", "session", "set", "sets", "shard", "share", "shared", "short", "show",
    "signal", "similar", "size", "skewed", "smallint", "snapshot", "some", "source", "space",
    "spaces", "sparse", "specific", "specifictype", "split", "sql", "sqlcode", "sqlerror",
    "sqlexception", "sqlstate", "sqlwarning", "start", "state", "static", "status", "storage",
    "store", "stored", "stream", "string", "struct", "style", "sub", "submultiset",
    "subpartition", "substring", "subtype", "sum", "super", "symmetric", "synonym", "system",
    "table", "tablesample", "temp", "temporary", "terminated", "text", "than", "then",
    "throughput", "time", "timestamp", "timezone", "tinyint", "to", "token", "total", "touch",
    "trailing", "transaction", "transform", "translate", "translation", "treat", "trigger",
    "trim", "true", "truncate", "ttl", "tuple", "type", "under", "undo", "union", "unique",
    "unit", "unknown", "unlogged", "unnest", "unprocessed", "unsigned", "until", "update",
    "upper", "url", "usage", "use", "user", "users", "using", "uuid", "vacuum", "value", "valued",
    "values", "varchar", "variable", "variance", "varint", "varying", "view", "views", "virtual",
    "void", "wait", "when", "whenever", "where", "while", "window", "with", "within", "without",
    "work", "wrapped", "write", "year", "zone",
    ];
}
