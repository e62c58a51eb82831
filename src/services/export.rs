// 导出文档：查询结果与聊天记录渲染成 Excel/Word 可直接打开的 HTML 表格页。
use chrono::{DateTime, Local};

const DOCUMENT_STYLE: &str = r#"<!DOCTYPE html><html><head><meta charset="UTF-8"><style>
body{font-family:"Microsoft YaHei",Arial,sans-serif;margin:24px;color:#222;}
h2{margin-bottom:4px;}
.meta{margin:2px 0;color:#555;font-size:13px;}
table{border-collapse:collapse;width:100%;margin-top:12px;}
th,td{border:1px solid #d0d7de;padding:8px;font-size:13px;vertical-align:top;}
th{background-color:#f6f8fa;text-align:left;}
tbody tr:nth-child(even){background-color:#fbfbfb;}
.empty{color:#888;text-align:center;font-style:italic;}
</style></head><body>"#;

const SQL_NOTE_LIMIT: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Excel,
    Word,
    Text,
}

impl ExportFormat {
    /// 空值返回 `default`，无法识别的格式返回 `None`。
    pub fn parse(raw: Option<&str>, default: ExportFormat) -> Option<Self> {
        let value = raw.map(str::trim).unwrap_or_default().to_ascii_lowercase();
        match value.as_str() {
            "" => Some(default),
            "excel" | "xls" => Some(ExportFormat::Excel),
            "word" | "doc" => Some(ExportFormat::Word),
            "text" | "txt" => Some(ExportFormat::Text),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Excel => "xls",
            ExportFormat::Word => "doc",
            ExportFormat::Text => "txt",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Excel => "application/vnd.ms-excel",
            ExportFormat::Word => "application/msword",
            ExportFormat::Text => "text/plain; charset=utf-8",
        }
    }
}

/// 行数为零时输出一行跨全部列的“暂无数据”。
pub fn build_table_document(
    title: &str,
    notes: &[String],
    columns: &[String],
    rows: &[Vec<String>],
) -> String {
    let mut output = String::from(DOCUMENT_STYLE);
    if !title.is_empty() {
        output.push_str(&format!("<h2>{}</h2>", escape_html(title)));
    }
    for note in notes.iter().filter(|note| !note.trim().is_empty()) {
        output.push_str(&format!("<p class=\"meta\">{}</p>", escape_html(note)));
    }
    output.push_str("<table><thead><tr>");
    for column in columns {
        output.push_str(&format!("<th>{}</th>", escape_html(column)));
    }
    output.push_str("</tr></thead><tbody>");
    if rows.is_empty() {
        output.push_str(&format!(
            "<tr><td class=\"empty\" colspan=\"{}\">暂无数据</td></tr>",
            columns.len().max(1)
        ));
    }
    for row in rows {
        output.push_str("<tr>");
        for cell in row {
            output.push_str("<td>");
            output.push_str(&escape_html(cell).replace('\n', "<br/>"));
            output.push_str("</td>");
        }
        output.push_str("</tr>");
    }
    output.push_str("</tbody></table></body></html>");
    output
}

/// 查询结果导出页的说明行：导出时间、行数与截断后的语句。
pub fn sql_export_notes(sql: &str, row_count: usize, truncated: bool, at: DateTime<Local>) -> Vec<String> {
    let mut count = format!("总行数：{row_count}");
    if truncated {
        count.push_str(&format!("（已限制在前 {row_count} 行）"));
    }
    vec![
        format!("导出时间：{}", at.format("%Y-%m-%d %H:%M:%S")),
        count,
        format!("SQL：{}", truncate_chars(sql.trim(), SQL_NOTE_LIMIT)),
    ]
}

pub fn default_export_name(prefix: &str, at: DateTime<Local>) -> String {
    format!("{prefix}_{}", at.format("%Y%m%d_%H%M%S"))
}

/// 去掉引号与换行、路径分隔符，保证能放进 Content-Disposition。
pub fn sanitize_filename(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .filter(|ch| *ch != '"')
        .map(|ch| match ch {
            '\n' | '\r' | '/' | '\\' => '_',
            other => other,
        })
        .collect();
    if cleaned.trim().is_empty() {
        "export".to_string()
    } else {
        cleaned
    }
}

/// 非 ASCII 文件名同时给出 RFC 5987 编码的 `filename*`。
pub fn content_disposition(filename: &str) -> String {
    let ascii_name: String = filename
        .chars()
        .map(|ch| if ch.is_ascii() && !ch.is_ascii_control() { ch } else { '_' })
        .collect();
    if ascii_name == filename {
        return format!("attachment; filename=\"{ascii_name}\"");
    }
    format!(
        "attachment; filename=\"{ascii_name}\"; filename*=UTF-8''{}",
        percent_encode(filename)
    )
}

fn percent_encode(value: &str) -> String {
    let mut output = String::new();
    for byte in value.as_bytes() {
        let ch = *byte as char;
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '~') {
            output.push(ch);
        } else {
            output.push_str(&format!("%{byte:02X}"));
        }
    }
    output
}

fn escape_html(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&#34;"),
            '\'' => output.push_str("&#39;"),
            other => output.push(other),
        }
    }
    output
}

fn truncate_chars(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let mut output: String = value.chars().take(limit).collect();
    output.push_str("...");
    output
}
