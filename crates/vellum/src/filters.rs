//! Built-in template filters.
//!
//! A filter is a function `(input, parameter) -> value`; the parameter is
//! the evaluated expression after `:`, or nil when omitted. The set owns a
//! name → function table seeded with the builtins below; templates resolve
//! filters from that table at parse time.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, FixedOffset};
use rand::seq::SliceRandom;
use regex::Regex;

use crate::error::Error;
use crate::value::{escape_html, Value, ValueData};

/// The shape of a registered filter.
pub type FilterFunction = Arc<dyn Fn(&Value, &Value) -> Result<Value, Error> + Send + Sync>;

/// Seeds a filter table with every built-in filter.
pub(crate) fn register_builtins(table: &mut HashMap<String, FilterFunction>) {
    let builtins: &[(&str, fn(&Value, &Value) -> Result<Value, Error>)] = &[
        // String transforms
        ("upper", filter_upper),
        ("lower", filter_lower),
        ("capfirst", filter_capfirst),
        ("title", filter_title),
        ("cut", filter_cut),
        ("addslashes", filter_addslashes),
        ("center", filter_center),
        ("ljust", filter_ljust),
        ("rjust", filter_rjust),
        ("slugify", filter_slugify),
        ("split", filter_split),
        ("make_list", filter_make_list),
        ("phone2numeric", filter_phone2numeric),
        ("wordcount", filter_wordcount),
        ("wordwrap", filter_wordwrap),
        ("stringformat", filter_stringformat),
        ("linenumbers", filter_linenumbers),
        // Truncation
        ("truncatechars", filter_truncatechars),
        ("truncatechars_html", filter_truncatechars_html),
        ("truncatewords", filter_truncatewords),
        ("truncatewords_html", filter_truncatewords_html),
        // Escaping and HTML
        ("escape", filter_escape),
        ("safe", filter_safe),
        ("escapejs", filter_escapejs),
        ("striptags", filter_striptags),
        ("removetags", filter_removetags),
        ("linebreaks", filter_linebreaks),
        ("linebreaksbr", filter_linebreaksbr),
        ("urlize", filter_urlize),
        ("urlizetrunc", filter_urlizetrunc),
        ("urlencode", filter_urlencode),
        ("iriencode", filter_iriencode),
        // Lists
        ("length", filter_length),
        ("first", filter_first),
        ("last", filter_last),
        ("join", filter_join),
        ("slice", filter_slice),
        ("random", filter_random),
        ("in", filter_in),
        // Numbers
        ("add", filter_add),
        ("floatformat", filter_floatformat),
        ("filesizeformat", filter_filesizeformat),
        ("get_digit", filter_get_digit),
        ("float", filter_float),
        ("integer", filter_integer),
        // Logic
        ("default", filter_default),
        ("default_if_none", filter_default_if_none),
        ("yesno", filter_yesno),
        ("pluralize", filter_pluralize),
        // Dates
        ("date", filter_date),
        ("time", filter_time),
    ];
    for (name, f) in builtins {
        table.insert((*name).to_string(), Arc::new(*f));
    }
}

fn err(message: impl Into<String>) -> Error {
    Error::new("filter", message)
}

// ============================================================
// String transforms
// ============================================================

fn filter_upper(value: &Value, _param: &Value) -> Result<Value, Error> {
    Ok(Value::from(value.to_display_string().to_uppercase()))
}

fn filter_lower(value: &Value, _param: &Value) -> Result<Value, Error> {
    Ok(Value::from(value.to_display_string().to_lowercase()))
}

fn filter_capfirst(value: &Value, _param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let mut chars = s.chars();
    let result = match chars.next() {
        Some(c) => format!("{}{}", c.to_uppercase(), chars.as_str()),
        None => String::new(),
    };
    Ok(Value::from(result))
}

fn filter_title(value: &Value, _param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let titled = s
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(c) => format!("{}{}", c.to_uppercase(), chars.as_str().to_lowercase()),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    Ok(Value::from(titled))
}

fn filter_cut(value: &Value, param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let needle = param.to_display_string();
    if needle.is_empty() {
        return Ok(Value::from(s));
    }
    Ok(Value::from(s.replace(&needle, "")))
}

fn filter_addslashes(value: &Value, _param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    Ok(Value::from(
        s.replace('\\', "\\\\")
            .replace('\'', "\\'")
            .replace('"', "\\\""),
    ))
}

fn pad_width(param: &Value) -> usize {
    param.as_integer().unwrap_or(0).max(0) as usize
}

fn filter_center(value: &Value, param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let width = pad_width(param);
    let len = s.chars().count();
    if len >= width {
        return Ok(Value::from(s));
    }
    let total = width - len;
    let left = total / 2;
    let right = total - left;
    Ok(Value::from(format!(
        "{}{s}{}",
        " ".repeat(left),
        " ".repeat(right)
    )))
}

fn filter_ljust(value: &Value, param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let width = pad_width(param);
    let len = s.chars().count();
    if len >= width {
        return Ok(Value::from(s));
    }
    Ok(Value::from(format!("{s}{}", " ".repeat(width - len))))
}

fn filter_rjust(value: &Value, param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let width = pad_width(param);
    let len = s.chars().count();
    if len >= width {
        return Ok(Value::from(s));
    }
    Ok(Value::from(format!("{}{s}", " ".repeat(width - len))))
}

fn filter_slugify(value: &Value, _param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string().to_lowercase();
    let mut out = String::with_capacity(s.len());
    let mut last_dash = true;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if (c.is_whitespace() || c == '-' || c == '_') && !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    Ok(Value::from(out))
}

fn filter_split(value: &Value, param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let sep = param.to_display_string();
    let parts: Vec<Value> = if sep.is_empty() {
        s.chars().map(|c| Value::from(c.to_string())).collect()
    } else {
        s.split(&sep).map(Value::from).collect()
    };
    Ok(Value::from(parts))
}

fn filter_make_list(value: &Value, _param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let items: Vec<Value> = s.chars().map(|c| Value::from(c.to_string())).collect();
    Ok(Value::from(items))
}

fn filter_phone2numeric(value: &Value, _param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let mapped: String = s
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            'a' | 'b' | 'c' => '2',
            'd' | 'e' | 'f' => '3',
            'g' | 'h' | 'i' => '4',
            'j' | 'k' | 'l' => '5',
            'm' | 'n' | 'o' => '6',
            'p' | 'q' | 'r' | 's' => '7',
            't' | 'u' | 'v' => '8',
            'w' | 'x' | 'y' | 'z' => '9',
            _ => c,
        })
        .collect();
    Ok(Value::from(mapped))
}

fn filter_wordcount(value: &Value, _param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    Ok(Value::from(s.split_whitespace().count()))
}

fn filter_wordwrap(value: &Value, param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let width = param.as_integer().unwrap_or(0).max(0) as usize;
    if width == 0 {
        return Ok(Value::from(s));
    }
    let mut lines: Vec<String> = Vec::new();
    let mut line = String::new();
    for word in s.split_whitespace() {
        if line.is_empty() {
            line = word.to_string();
        } else if line.chars().count() + 1 + word.chars().count() > width {
            lines.push(std::mem::take(&mut line));
            line = word.to_string();
        } else {
            line.push(' ');
            line.push_str(word);
        }
    }
    if !line.is_empty() {
        lines.push(line);
    }
    Ok(Value::from(lines.join("\n")))
}

/// A printf-style formatter covering the verbs templates actually use:
/// `d i s f e E x X o b` with optional `0`/`-`/`+` flags, width and
/// precision.
fn filter_stringformat(value: &Value, param: &Value) -> Result<Value, Error> {
    let spec = param.to_display_string();
    let Some(verb) = spec.chars().last() else {
        return Ok(Value::from(value.to_display_string()));
    };
    let body = &spec[..spec.len() - verb.len_utf8()];
    let zero_pad = body.starts_with('0');
    let left_align = body.contains('-');
    let plus = body.contains('+');
    let digits = body.trim_start_matches(['0', '-', '+']);
    let (width_s, prec_s) = match digits.split_once('.') {
        Some((w, p)) => (w, Some(p)),
        None => (digits, None),
    };
    let width: usize = width_s.parse().unwrap_or(0);
    let prec: usize = prec_s.and_then(|p| p.parse().ok()).unwrap_or(6);

    let base = match verb {
        'd' | 'i' => {
            let n = value.as_integer().unwrap_or(0);
            if plus && n >= 0 {
                format!("+{n}")
            } else {
                n.to_string()
            }
        }
        's' => value.to_display_string(),
        'f' => format!("{:.prec$}", value.as_float().unwrap_or(0.0)),
        'e' => format!("{:.prec$e}", value.as_float().unwrap_or(0.0)),
        'E' => format!("{:.prec$e}", value.as_float().unwrap_or(0.0)).to_uppercase(),
        'x' => format!("{:x}", value.as_integer().unwrap_or(0)),
        'X' => format!("{:X}", value.as_integer().unwrap_or(0)),
        'o' => format!("{:o}", value.as_integer().unwrap_or(0)),
        'b' => format!("{:b}", value.as_integer().unwrap_or(0)),
        _ => return Err(err(format!("stringformat: unsupported verb '{verb}'"))),
    };

    let padded = if base.chars().count() >= width {
        base
    } else {
        let pad = width - base.chars().count();
        if left_align {
            format!("{base}{}", " ".repeat(pad))
        } else if zero_pad {
            if let Some(rest) = base.strip_prefix('-') {
                format!("-{}{rest}", "0".repeat(pad))
            } else {
                format!("{}{base}", "0".repeat(pad))
            }
        } else {
            format!("{}{base}", " ".repeat(pad))
        }
    };
    Ok(Value::from(padded))
}

fn filter_linenumbers(value: &Value, _param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let lines: Vec<&str> = s.lines().collect();
    let width = lines.len().to_string().len();
    let numbered: Vec<String> = lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{:0width$}. {line}", i + 1))
        .collect();
    Ok(Value::from(numbered.join("\n")))
}

// ============================================================
// Truncation
// ============================================================

fn filter_truncatechars(value: &Value, param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let max_len = param.as_integer().unwrap_or(0).max(0) as usize;
    if max_len == 0 || s.chars().count() <= max_len {
        return Ok(Value::from(s));
    }
    if max_len <= 3 {
        return Ok(Value::from("..."));
    }
    let truncated: String = s.chars().take(max_len - 3).collect();
    Ok(Value::from(format!("{truncated}...")))
}

fn filter_truncatewords(value: &Value, param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let max_words = param.as_integer().unwrap_or(0).max(0) as usize;
    let words: Vec<&str> = s.split_whitespace().collect();
    if max_words == 0 || words.len() <= max_words {
        return Ok(Value::from(s));
    }
    Ok(Value::from(format!("{} ...", words[..max_words].join(" "))))
}

/// Void elements that never receive a closing tag.
const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Counts the visible text characters of `s`, skipping `<...>` tags.
fn html_text_len(s: &str) -> usize {
    let mut count = 0;
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => count += 1,
            _ => {}
        }
    }
    count
}

/// Walks HTML, budgeting only the text between tags. `unit_words` switches
/// the budget from characters to whitespace-separated words. Open tags are
/// closed in reverse order after truncation.
fn truncate_html(s: &str, budget: usize, unit_words: bool, ellipsis: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut open: Vec<String> = Vec::new();
    let mut used = 0usize;
    let mut in_word = false;
    let mut truncated = false;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c == '<' {
            let mut tag = String::from('<');
            for t in chars.by_ref() {
                tag.push(t);
                if t == '>' {
                    break;
                }
            }
            let inner = tag.trim_start_matches('<').trim_end_matches('>').trim();
            let closing = inner.starts_with('/');
            let name: String = inner
                .trim_start_matches('/')
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            let self_closing = inner.ends_with('/') || VOID_TAGS.contains(&name.as_str());
            if !truncated {
                out.push_str(&tag);
                if closing {
                    if let Some(pos) = open.iter().rposition(|t| *t == name) {
                        open.remove(pos);
                    }
                } else if !self_closing && !name.is_empty() {
                    open.push(name);
                }
            }
            continue;
        }
        if truncated {
            continue;
        }
        if unit_words {
            if c.is_whitespace() {
                in_word = false;
            } else if !in_word {
                in_word = true;
                used += 1;
                if used > budget {
                    truncated = true;
                    while out.ends_with(char::is_whitespace) {
                        out.pop();
                    }
                    out.push_str(ellipsis);
                    continue;
                }
            }
        } else {
            used += 1;
            if used > budget {
                truncated = true;
                out.push_str(ellipsis);
                continue;
            }
        }
        out.push(c);
    }

    if truncated {
        for tag in open.iter().rev() {
            out.push_str(&format!("</{tag}>"));
        }
    }
    out
}

fn filter_truncatechars_html(value: &Value, param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let max_len = param.as_integer().unwrap_or(0).max(0) as usize;
    // Whether to truncate is decided against the full visible length, like
    // the plain-text filter; the ellipsis only eats into the budget once
    // truncation is actually needed.
    if max_len == 0 || html_text_len(&s) <= max_len {
        return Ok(Value::safe(s));
    }
    let budget = max_len.saturating_sub(3).max(1);
    Ok(Value::safe(truncate_html(&s, budget, false, "...")))
}

fn filter_truncatewords_html(value: &Value, param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let max_words = param.as_integer().unwrap_or(0).max(0) as usize;
    if max_words == 0 {
        return Ok(Value::from(s));
    }
    Ok(Value::safe(truncate_html(&s, max_words, true, " ...")))
}

// ============================================================
// Escaping and HTML
// ============================================================

fn filter_escape(value: &Value, _param: &Value) -> Result<Value, Error> {
    Ok(Value::safe(escape_html(&value.to_display_string())))
}

fn filter_safe(value: &Value, _param: &Value) -> Result<Value, Error> {
    Ok(value.clone().mark_safe())
}

fn filter_escapejs(value: &Value, _param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\u005C"),
            '\'' => out.push_str("\\u0027"),
            '"' => out.push_str("\\u0022"),
            '<' => out.push_str("\\u003C"),
            '>' => out.push_str("\\u003E"),
            '&' => out.push_str("\\u0026"),
            '=' => out.push_str("\\u003D"),
            '\n' => out.push_str("\\u000A"),
            '\r' => out.push_str("\\u000D"),
            '\t' => out.push_str("\\u0009"),
            _ => out.push(c),
        }
    }
    Ok(Value::safe(out))
}

fn strip_tags_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*?>").unwrap())
}

fn filter_striptags(value: &Value, _param: &Value) -> Result<Value, Error> {
    let mut s = value.to_display_string();
    // Nested obfuscations like `<scr<script>ipt>` reassemble after one
    // pass, so strip to a fixed point.
    loop {
        let stripped = strip_tags_re().replace_all(&s, "").to_string();
        if stripped == s {
            return Ok(Value::from(stripped));
        }
        s = stripped;
    }
}

fn filter_removetags(value: &Value, param: &Value) -> Result<Value, Error> {
    let mut s = value.to_display_string();
    let names: Vec<String> = param
        .to_display_string()
        .split_whitespace()
        .map(regex::escape)
        .collect();
    if names.is_empty() {
        return Ok(Value::from(s));
    }
    let pattern = format!(r"(?i)<\s*/?\s*(?:{})\b[^>]*?>", names.join("|"));
    let re = Regex::new(&pattern)
        .map_err(|e| err("removetags: invalid tag list").with_cause(e))?;
    loop {
        let removed = re.replace_all(&s, "").to_string();
        if removed == s {
            return Ok(Value::from(removed));
        }
        s = removed;
    }
}

fn filter_linebreaks(value: &Value, _param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let normalized = s.replace("\r\n", "\n");
    let result = normalized
        .split("\n\n")
        .map(|p| format!("<p>{}</p>", p.replace('\n', "<br>")))
        .collect::<Vec<_>>()
        .join("\n\n");
    Ok(Value::safe(result))
}

fn filter_linebreaksbr(value: &Value, _param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    Ok(Value::safe(s.replace("\r\n", "<br>").replace('\n', "<br>")))
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:https?://|www\.)[^\s<>\x22]+").unwrap())
}

fn urlize_with_limit(s: &str, limit: Option<usize>) -> String {
    url_re()
        .replace_all(s, |caps: &regex::Captures<'_>| {
            let url = &caps[0];
            let href = if url.starts_with("www.") {
                format!("http://{url}")
            } else {
                url.to_string()
            };
            let text = match limit {
                Some(n) if url.chars().count() > n => {
                    let head: String = url.chars().take(n.saturating_sub(3)).collect();
                    format!("{head}...")
                }
                _ => url.to_string(),
            };
            format!(r#"<a href="{href}" rel="nofollow">{text}</a>"#)
        })
        .to_string()
}

fn filter_urlize(value: &Value, _param: &Value) -> Result<Value, Error> {
    Ok(Value::safe(urlize_with_limit(
        &value.to_display_string(),
        None,
    )))
}

fn filter_urlizetrunc(value: &Value, param: &Value) -> Result<Value, Error> {
    let limit = param.as_integer().unwrap_or(0).max(0) as usize;
    Ok(Value::safe(urlize_with_limit(
        &value.to_display_string(),
        (limit > 0).then_some(limit),
    )))
}

fn encode_with_safe(s: &str, safe: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        let c = byte as char;
        if byte.is_ascii_alphanumeric()
            || matches!(c, '_' | '.' | '-' | '~')
            || safe.contains(c)
        {
            out.push(c);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn filter_urlencode(value: &Value, param: &Value) -> Result<Value, Error> {
    let s = value.to_display_string();
    let safe = if param.is_nil() {
        "/".to_string()
    } else {
        param.to_display_string()
    };
    Ok(Value::from(encode_with_safe(&s, &safe)))
}

fn filter_iriencode(value: &Value, _param: &Value) -> Result<Value, Error> {
    use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
    // Everything an IRI keeps verbatim: unreserved, reserved and `%`.
    const IRI_KEEP: &AsciiSet = &CONTROLS
        .add(b' ')
        .add(b'"')
        .add(b'<')
        .add(b'>')
        .add(b'\\')
        .add(b'^')
        .add(b'`')
        .add(b'{')
        .add(b'|')
        .add(b'}');
    let s = value.to_display_string();
    Ok(Value::from(
        utf8_percent_encode(&s, IRI_KEEP).to_string(),
    ))
}

// ============================================================
// Lists
// ============================================================

fn filter_length(value: &Value, _param: &Value) -> Result<Value, Error> {
    Ok(Value::from(value.len().unwrap_or(0)))
}

fn filter_first(value: &Value, _param: &Value) -> Result<Value, Error> {
    Ok(value.index(0).unwrap_or_else(Value::none))
}

fn filter_last(value: &Value, _param: &Value) -> Result<Value, Error> {
    Ok(value.index(-1).unwrap_or_else(Value::none))
}

fn filter_join(value: &Value, param: &Value) -> Result<Value, Error> {
    let Some(items) = value.as_list() else {
        return Ok(value.clone());
    };
    let sep = param.to_display_string();
    let joined = items
        .iter()
        .map(Value::to_display_string)
        .collect::<Vec<_>>()
        .join(&sep);
    Ok(Value::from(joined))
}

fn filter_slice(value: &Value, param: &Value) -> Result<Value, Error> {
    let spec = param.to_display_string();
    let parse_bound = |s: &str| -> Result<Option<i64>, Error> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        s.parse::<i64>()
            .map(Some)
            .map_err(|_| err(format!("slice: invalid bound '{s}'")))
    };
    let (from, to) = match spec.split_once(':') {
        Some((a, b)) => (parse_bound(a)?, parse_bound(b)?),
        None => (None, parse_bound(&spec)?),
    };
    Ok(value.slice(from, to).unwrap_or_else(|| value.clone()))
}

fn filter_random(value: &Value, _param: &Value) -> Result<Value, Error> {
    let Some(items) = value.as_list() else {
        return Ok(Value::none());
    };
    let mut rng = rand::thread_rng();
    Ok(items.choose(&mut rng).cloned().unwrap_or_else(Value::none))
}

fn filter_in(value: &Value, param: &Value) -> Result<Value, Error> {
    Ok(Value::from(param.contains(value)))
}

// ============================================================
// Numbers
// ============================================================

fn filter_add(value: &Value, param: &Value) -> Result<Value, Error> {
    if let (Some(a), Some(b)) = (value.as_integer(), param.as_integer()) {
        if !value.is_float() && !param.is_float() {
            return Ok(Value::from(a.wrapping_add(b)));
        }
    }
    if let (Some(a), Some(b)) = (value.as_float(), param.as_float()) {
        if value.is_number() && param.is_number() {
            return Ok(Value::from(a + b));
        }
    }
    if let (ValueData::List(a), ValueData::List(b)) = (&value.data, &param.data) {
        let mut merged = a.clone();
        merged.extend(b.iter().cloned());
        return Ok(Value::from(merged));
    }
    Ok(Value::from(format!(
        "{}{}",
        value.to_display_string(),
        param.to_display_string()
    )))
}

fn filter_floatformat(value: &Value, param: &Value) -> Result<Value, Error> {
    let Some(f) = value.as_float() else {
        return Ok(value.clone());
    };
    let places = if param.is_nil() {
        -1
    } else {
        param.as_integer().unwrap_or(-1)
    };
    let decimals = places.unsigned_abs() as usize;
    let only_if_fractional = places < 0;
    let rounded = format!("{f:.decimals$}");
    if only_if_fractional {
        let back: f64 = rounded.parse().unwrap_or(f);
        if back.fract() == 0.0 {
            return Ok(Value::from(format!("{}", back as i64)));
        }
    }
    Ok(Value::from(rounded))
}

fn filter_filesizeformat(value: &Value, _param: &Value) -> Result<Value, Error> {
    let Some(bytes) = value.as_float() else {
        return Ok(Value::from("0 bytes"));
    };
    let bytes = bytes.max(0.0);
    if bytes < 1024.0 {
        let n = bytes as i64;
        let unit = if n == 1 { "byte" } else { "bytes" };
        return Ok(Value::from(format!("{n} {unit}")));
    }
    let units = ["KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes / 1024.0;
    for unit in units {
        if size < 1024.0 {
            return Ok(Value::from(format!("{size:.1} {unit}")));
        }
        size /= 1024.0;
    }
    Ok(Value::from(format!("{:.1} EB", size)))
}

fn filter_get_digit(value: &Value, param: &Value) -> Result<Value, Error> {
    let (Some(n), Some(pos)) = (value.as_integer(), param.as_integer()) else {
        return Ok(value.clone());
    };
    if pos < 1 {
        return Ok(value.clone());
    }
    let digits = n.unsigned_abs().to_string();
    let chars: Vec<char> = digits.chars().collect();
    if (pos as usize) > chars.len() {
        return Ok(Value::from(0i64));
    }
    let digit = chars[chars.len() - pos as usize];
    Ok(Value::from(i64::from(digit.to_digit(10).unwrap_or(0))))
}

fn filter_float(value: &Value, _param: &Value) -> Result<Value, Error> {
    Ok(Value::from(value.as_float().unwrap_or(0.0)))
}

fn filter_integer(value: &Value, _param: &Value) -> Result<Value, Error> {
    Ok(Value::from(value.as_integer().unwrap_or(0)))
}

// ============================================================
// Logic
// ============================================================

fn filter_default(value: &Value, param: &Value) -> Result<Value, Error> {
    if value.is_truthy() {
        Ok(value.clone())
    } else {
        Ok(param.clone())
    }
}

fn filter_default_if_none(value: &Value, param: &Value) -> Result<Value, Error> {
    if value.is_nil() {
        Ok(param.clone())
    } else {
        Ok(value.clone())
    }
}

fn filter_yesno(value: &Value, param: &Value) -> Result<Value, Error> {
    let spec = if param.is_nil() {
        "yes,no,maybe".to_string()
    } else {
        param.to_display_string()
    };
    let choices: Vec<&str> = spec.split(',').collect();
    if choices.len() < 2 {
        return Err(err("yesno: parameter must provide at least two choices"));
    }
    let chosen = if value.is_nil() && choices.len() > 2 {
        choices[2]
    } else if value.is_truthy() {
        choices[0]
    } else {
        choices[1]
    };
    Ok(Value::from(chosen))
}

fn filter_pluralize(value: &Value, param: &Value) -> Result<Value, Error> {
    let n = value.as_integer().or_else(|| value.len().map(|l| l as i64));
    let Some(n) = n else {
        return Ok(Value::from(""));
    };
    let spec = if param.is_nil() {
        "s".to_string()
    } else {
        param.to_display_string()
    };
    let (singular, plural) = match spec.split_once(',') {
        Some((s, p)) => (s.to_string(), p.to_string()),
        None => (String::new(), spec),
    };
    Ok(Value::from(if n == 1 { singular } else { plural }))
}

// ============================================================
// Dates
// ============================================================

/// Formats a date-time using Django-style format characters (`Y`, `m`,
/// `d`, `H`, `i`, ...). A backslash escapes the next character.
pub(crate) fn django_date_format(dt: &DateTime<FixedOffset>, format: &str) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        match c {
            'Y' => out.push_str(&dt.format("%Y").to_string()),
            'y' => out.push_str(&dt.format("%y").to_string()),
            'm' => out.push_str(&dt.format("%m").to_string()),
            'n' => out.push_str(&dt.format("%-m").to_string()),
            'd' => out.push_str(&dt.format("%d").to_string()),
            'j' => out.push_str(&dt.format("%-d").to_string()),
            'D' => out.push_str(&dt.format("%a").to_string()),
            'l' => out.push_str(&dt.format("%A").to_string()),
            'F' => out.push_str(&dt.format("%B").to_string()),
            'M' => out.push_str(&dt.format("%b").to_string()),
            'N' => out.push_str(&format!("{}.", dt.format("%b"))),
            'H' => out.push_str(&dt.format("%H").to_string()),
            'G' => out.push_str(&dt.format("%-H").to_string()),
            'h' => out.push_str(&dt.format("%I").to_string()),
            'g' => out.push_str(&dt.format("%-I").to_string()),
            'i' => out.push_str(&dt.format("%M").to_string()),
            's' => out.push_str(&dt.format("%S").to_string()),
            'A' => out.push_str(&dt.format("%p").to_string()),
            'a' => {
                let half = dt.format("%P").to_string();
                if half == "am" {
                    out.push_str("a.m.");
                } else {
                    out.push_str("p.m.");
                }
            }
            'P' => {
                let hour = dt.format("%-I").to_string();
                let minute = dt.format("%M").to_string();
                let half = if dt.format("%P").to_string() == "am" {
                    "a.m."
                } else {
                    "p.m."
                };
                if minute == "00" {
                    let _ = write!(out, "{hour} {half}");
                } else {
                    let _ = write!(out, "{hour}:{minute} {half}");
                }
            }
            'f' => {
                let hour = dt.format("%-I").to_string();
                let minute = dt.format("%M").to_string();
                if minute == "00" {
                    out.push_str(&hour);
                } else {
                    let _ = write!(out, "{hour}:{minute}");
                }
            }
            'U' => out.push_str(&dt.timestamp().to_string()),
            'c' => out.push_str(&dt.format("%Y-%m-%dT%H:%M:%S%:z").to_string()),
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn filter_date(value: &Value, param: &Value) -> Result<Value, Error> {
    let Some(dt) = value.as_datetime() else {
        return Ok(Value::from(""));
    };
    let format = if param.is_nil() {
        "N j, Y".to_string()
    } else {
        param.to_display_string()
    };
    Ok(Value::from(django_date_format(&dt, &format)))
}

fn filter_time(value: &Value, param: &Value) -> Result<Value, Error> {
    let Some(dt) = value.as_datetime() else {
        return Ok(Value::from(""));
    };
    let format = if param.is_nil() {
        "P".to_string()
    } else {
        param.to_display_string()
    };
    Ok(Value::from(django_date_format(&dt, &format)))
}
