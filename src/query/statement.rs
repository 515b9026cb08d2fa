// Syntactic statement classification by leading keyword.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatementClass {
    /// Anything that is not DDL or a data mutation; results are cacheable.
    Read,
    /// `insert` / `replace`: affects rows and produces an insert id.
    Insert,
    /// `update` / `delete`.
    Mutation,
    /// `create` / `alter` / `truncate` / `drop`.
    Ddl,
}

impl StatementClass {
    pub fn is_mutating(self) -> bool {
        matches!(self, StatementClass::Insert | StatementClass::Mutation)
    }

    pub fn tracks_insert_id(self) -> bool {
        self == StatementClass::Insert
    }
}

pub fn classify(query: &str) -> StatementClass {
    let trimmed = query.trim_start();
    let keyword_len = trimmed
        .bytes()
        .take_while(|byte| byte.is_ascii_alphabetic())
        .count();
    let followed_by_space = trimmed[keyword_len..]
        .chars()
        .next()
        .is_some_and(char::is_whitespace);
    if keyword_len == 0 || !followed_by_space {
        return StatementClass::Read;
    }
    match trimmed[..keyword_len].to_ascii_lowercase().as_str() {
        "insert" | "replace" => StatementClass::Insert,
        "update" | "delete" => StatementClass::Mutation,
        "create" | "alter" | "truncate" | "drop" => StatementClass::Ddl,
        _ => StatementClass::Read,
    }
}

#[cfg(test)]
mod tests {
    use super::{StatementClass, classify};

    #[test]
    fn leading_keyword_decides_class() {
        let cases = [
            ("SELECT * FROM t", StatementClass::Read),
            ("  insert into t values (1)", StatementClass::Insert),
            ("REPLACE INTO t VALUES (1)", StatementClass::Insert),
            ("\n\tUpdate t SET a = 1", StatementClass::Mutation),
            ("delete from t", StatementClass::Mutation),
            ("DROP TABLE t", StatementClass::Ddl),
            ("truncate t", StatementClass::Ddl),
            ("SHOW TABLES", StatementClass::Read),
            ("", StatementClass::Read),
        ];
        for (query, class) in cases {
            assert_eq!(classify(query), class, "{query}");
        }
    }

    #[test]
    fn keyword_must_be_followed_by_whitespace() {
        assert_eq!(classify("insert"), StatementClass::Read);
        assert_eq!(classify("updated_at"), StatementClass::Read);
        assert_eq!(classify("delete(1)"), StatementClass::Read);
    }

    #[test]
    fn mutating_flags() {
        assert!(StatementClass::Insert.is_mutating());
        assert!(StatementClass::Mutation.is_mutating());
        assert!(!StatementClass::Ddl.is_mutating());
        assert!(StatementClass::Insert.tracks_insert_id());
        assert!(!StatementClass::Mutation.tracks_insert_id());
    }
}
