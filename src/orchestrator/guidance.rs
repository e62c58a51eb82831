// 护栏复查：模型输出看起来不是可执行 SQL 时改走提示路径。

const UNRESOLVED_MARKERS: [&str; 3] = ["NOT FOUND", "DOES NOT CONTAIN", "NO TABLE"];

pub fn needs_guidance(sql: &str) -> bool {
    let upper = sql.trim().to_uppercase();
    if upper.is_empty() || upper.starts_with("ERROR") {
        return true;
    }
    UNRESOLVED_MARKERS
        .iter()
        .any(|marker| upper.contains(marker))
}
