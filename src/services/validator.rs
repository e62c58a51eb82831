// SQL 安全校验：只读语句白名单 + 关键词黑名单 + 注入启发式 + 多语句检测。
// 这里只是文本层面的兜底，真正的安全边界是数据仓库的只读事务。
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "GRANT", "REVOKE",
    "EXEC", "EXECUTE", "PRAGMA", "VACUUM", "ANALYZE", "ATTACH", "DETACH", "MERGE", "CALL",
    "COPY", "LOCK",
];

const SET_OPERATORS: &[&str] = &["UNION", "INTERSECT", "EXCEPT", "MINUS"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    Empty,
    NotReadQuery,
    ForbiddenKeyword,
    SuspectedInjection,
    StackedQueries,
}

impl ValidationError {
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::Empty => "SQL query cannot be empty",
            ValidationError::NotReadQuery => "only SELECT queries are allowed",
            ValidationError::ForbiddenKeyword => "query contains forbidden keywords",
            ValidationError::SuspectedInjection => "potential SQL injection detected",
            ValidationError::StackedQueries => "stacked queries are not allowed",
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

impl std::error::Error for ValidationError {}

/// 按顺序执行全部检查，首个失败即返回。
pub fn validate(sql: &str) -> Result<(), ValidationError> {
    let sql = sql.trim();
    if sql.is_empty() {
        return Err(ValidationError::Empty);
    }
    if !is_read_query(sql) {
        return Err(ValidationError::NotReadQuery);
    }
    if has_forbidden_keywords(sql) {
        return Err(ValidationError::ForbiddenKeyword);
    }
    if has_injection_patterns(sql) {
        return Err(ValidationError::SuspectedInjection);
    }
    if has_stacked_queries(sql) {
        return Err(ValidationError::StackedQueries);
    }
    Ok(())
}

fn is_read_query(sql: &str) -> bool {
    let upper = sql.to_uppercase();
    if upper.starts_with('(') || upper.starts_with("SELECT") {
        return true;
    }
    // CTE 需要以 WITH 开头且后续仍是 SELECT。
    let mut words = upper.split_whitespace();
    if words.next() == Some("WITH") {
        return upper.contains("SELECT");
    }
    false
}

/// 字符串字面量内的单词不算关键字，先抹掉再按词边界匹配。
fn has_forbidden_keywords(sql: &str) -> bool {
    let code = blank_literals(&sql.to_uppercase());
    forbidden_regex().is_match(&code) || side_effect_function_regex().is_match(&code)
}

fn forbidden_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        let pattern = format!(r"\b(?:{})\b", FORBIDDEN_KEYWORDS.join("|"));
        Regex::new(&pattern).expect("invalid forbidden keyword regex")
    })
}

/// 能改写会话参数或产生副作用的函数调用。
fn side_effect_function_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"\b(?:SET_CONFIG|NEXTVAL|SETVAL|LO_[A-Z_]+|DBLINK[A-Z_]*|PG_SLEEP[A-Z_]*|PG_TERMINATE_BACKEND|PG_CANCEL_BACKEND|PG_RELOAD_CONF|PG_ADVISORY_[A-Z_]+)\s*\(",
        )
        .expect("invalid side effect function regex")
    })
}

/// 把单引号/双引号中的内容替换为空格，保留长度与引号本身。
fn blank_literals(sql: &str) -> String {
    let mut output = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut prev = '\0';
    for ch in sql.chars() {
        match quote {
            Some(open) => {
                if ch == open && prev != '\\' {
                    quote = None;
                    output.push(ch);
                } else {
                    output.push(' ');
                }
            }
            None => {
                if ch == '\'' || ch == '"' {
                    quote = Some(ch);
                }
                output.push(ch);
            }
        }
        prev = ch;
    }
    output
}

fn quote_comment_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"'[^\n]*--").expect("invalid quote comment regex"))
}

fn numeric_tautology_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"\bOR\s+(\d+)\s*=\s*(\d+)\b").expect("invalid tautology regex")
    })
}

fn quoted_tautology_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"\bOR\s+'([^']*)'\s*=\s*'([^']*)'").expect("invalid tautology regex")
    })
}

fn quoted_union_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"'\s*\)?\s*UNION\s+(?:ALL\s+)?SELECT\b").expect("invalid union regex")
    })
}

fn procedure_prefix_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"\b(?:XP|SP)_[A-Z0-9_]+\s*\(").expect("invalid procedure regex")
    })
}

fn has_injection_patterns(sql: &str) -> bool {
    let upper = sql.to_uppercase();
    if quote_comment_regex().is_match(&upper) {
        return true;
    }
    // 恒真条件：OR 1=1、OR 'a'='a'。
    let numeric = numeric_tautology_regex()
        .captures_iter(&upper)
        .any(|caps| caps.get(1).map(|m| m.as_str()) == caps.get(2).map(|m| m.as_str()));
    if numeric {
        return true;
    }
    let quoted = quoted_tautology_regex()
        .captures_iter(&upper)
        .any(|caps| caps.get(1).map(|m| m.as_str()) == caps.get(2).map(|m| m.as_str()));
    if quoted {
        return true;
    }
    if quoted_union_regex().is_match(&upper) || has_multiple_roots(sql) {
        return true;
    }
    procedure_prefix_regex().is_match(&upper)
}

/// 顶层出现的 SELECT 数量多于集合运算符所能连接的数量时，视为多根语句。
fn has_multiple_roots(sql: &str) -> bool {
    let words = top_level_words(sql);
    let selects = words.iter().filter(|word| word.as_str() == "SELECT").count();
    let connectors = words
        .iter()
        .filter(|word| SET_OPERATORS.contains(&word.as_str()))
        .count();
    selects > connectors + 1
}

/// 提取括号深度为 0 且不在字符串字面量中的单词（大写）。
fn top_level_words(sql: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;
    let mut prev = '\0';
    for ch in sql.chars() {
        if let Some(open) = quote {
            if ch == open && prev != '\\' {
                quote = None;
            }
            prev = ch;
            continue;
        }
        if ch.is_alphanumeric() || ch == '_' {
            if depth == 0 {
                current.push(ch);
            }
        } else {
            if !current.is_empty() {
                words.push(current.to_uppercase());
                current.clear();
            }
            match ch {
                '\'' | '"' => quote = Some(ch),
                '(' => depth += 1,
                ')' => depth = (depth - 1).max(0),
                _ => {}
            }
        }
        prev = ch;
    }
    if !current.is_empty() {
        words.push(current.to_uppercase());
    }
    words
}

fn comment_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?s)/\*.*?\*/|--[^\n]*").expect("invalid comment regex"))
}

fn has_stacked_queries(sql: &str) -> bool {
    let cleaned = comment_regex().replace_all(sql, "");
    let mut quote: Option<char> = None;
    let mut prev = '\0';
    let mut semicolons = 0;
    for ch in cleaned.chars() {
        if (ch == '\'' || ch == '"') && prev != '\\' {
            match quote {
                None => quote = Some(ch),
                Some(open) if open == ch => quote = None,
                _ => {}
            }
        }
        if ch == ';' && quote.is_none() {
            semicolons += 1;
        }
        prev = ch;
    }
    semicolons > 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_read_queries() {
        for sql in [
            "SELECT * FROM orders",
            "  select id from orders where status = 'open';",
            "WITH recent AS (SELECT id FROM orders) SELECT * FROM recent",
            "(SELECT 1)",
            "SELECT name FROM a UNION ALL SELECT name FROM b",
            "SELECT created_at, updated_by FROM audit_log",
            "SELECT note FROM tickets WHERE note = 'please delete'",
        ] {
            assert_eq!(validate(sql), Ok(()), "{sql}");
        }
    }

    #[test]
    fn rejects_empty_and_non_select() {
        assert_eq!(validate(""), Err(ValidationError::Empty));
        assert_eq!(validate("  \n\t"), Err(ValidationError::Empty));
        assert_eq!(
            validate("UPDATE orders SET x = 1"),
            Err(ValidationError::NotReadQuery)
        );
        assert_eq!(validate("SHOW TABLES"), Err(ValidationError::NotReadQuery));
        assert_eq!(validate("WITHDRAW"), Err(ValidationError::NotReadQuery));
    }

    #[test]
    fn rejects_forbidden_tokens_in_any_case_or_nesting() {
        for sql in [
            "SELECT * FROM (delete FROM orders)",
            "SELECT 1 FROM dual WHERE x IN (\nDROP TABLE y)",
            "select * from t;TRUNCATE t",
            "SELECT * FROM t WHERE a = 1 OR\tUpdate t",
            "WITH x AS (INSERT INTO t VALUES (1)) SELECT * FROM x",
            "SELECT * FROM t WHERE EXISTS (DELETE)",
            "SELECT 1 FROM t WHERE x IN (1,DROP)",
            "SELECT 1 FROM t,DELETE",
            "SELECT a FROM t WHERE b=DROP",
            "SELECT 'x'||DELETE FROM t",
        ] {
            assert_eq!(validate(sql), Err(ValidationError::ForbiddenKeyword), "{sql}");
        }
    }

    #[test]
    fn keyword_inside_identifier_is_allowed() {
        assert_eq!(validate("SELECT deleted_flag, creator FROM t"), Ok(()));
        assert_eq!(validate("SELECT drop_rate, t.update_time FROM t"), Ok(()));
        assert_eq!(validate("SELECT \"note\" FROM t WHERE kind = 'drop'"), Ok(()));
    }

    #[test]
    fn rejects_session_and_side_effect_functions() {
        for sql in [
            "SELECT set_config('default_transaction_read_only','off',false)",
            "SELECT nextval('orders_id_seq')",
            "SELECT setval ('orders_id_seq', 1)",
            "SELECT lo_unlink(42)",
            "SELECT pg_sleep(10)",
        ] {
            assert_eq!(validate(sql), Err(ValidationError::ForbiddenKeyword), "{sql}");
        }
        assert_eq!(validate("SELECT next_value, settings FROM t"), Ok(()));
    }

    #[test]
    fn rejects_injection_heuristics() {
        for sql in [
            "SELECT * FROM users WHERE name = 'admin'--'",
            "SELECT * FROM users WHERE id = 5 OR 1=1",
            "SELECT * FROM users WHERE name = '' OR 'a'='a'",
            "SELECT name FROM users WHERE id = '1' UNION SELECT password FROM secrets",
            "SELECT 1 SELECT 2",
            "SELECT * FROM t WHERE x = xp_cmdshell('dir')",
        ] {
            assert_eq!(validate(sql), Err(ValidationError::SuspectedInjection), "{sql}");
        }
    }

    #[test]
    fn rejects_stacked_queries() {
        assert_eq!(
            validate("SELECT 1 FROM a; SELECT 2 FROM b;"),
            Err(ValidationError::SuspectedInjection)
        );
        assert_eq!(
            validate("(SELECT 1); (SELECT 2);"),
            Err(ValidationError::StackedQueries)
        );
        assert_eq!(validate("SELECT ';;' AS s FROM t;"), Ok(()));
        assert_eq!(validate("SELECT 'it\\';' AS s FROM t;"), Ok(()));
    }

    #[test]
    fn stacked_drop_is_rejected() {
        let result = validate("SELECT 1 FROM dual; DROP TABLE x;");
        assert!(matches!(
            result,
            Err(ValidationError::ForbiddenKeyword) | Err(ValidationError::StackedQueries)
        ));
    }
}
