use crate::allocate::ParticipantRole;

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '"' {
            if in_quotes && chars.peek() == Some(&'"') {
                buf.push('"');
                chars.next();
                continue;
            }
            in_quotes = !in_quotes;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(std::mem::take(&mut buf));
            continue;
        }
        buf.push(ch);
    }
    out.push(buf);
    out
}

/// Accepts the role spellings seen in registration exports: the "0"/"1"
/// flag, booleans, and the named forms.
pub fn parse_role(raw: &str) -> Option<ParticipantRole> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "ordinary" => Some(ParticipantRole::Ordinary),
        "1" | "true" | "distinguished" | "infiltrado" => Some(ParticipantRole::Distinguished),
        _ => None,
    }
}

pub const EMAIL_MAX_LEN: usize = 254;

/// Loose shape check only: one `@` with text on both sides.
pub fn is_valid_email(email: &str) -> bool {
    if email.len() > EMAIL_MAX_LEN {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RosterRow {
    pub line: usize,
    pub name: String,
    pub email: Option<String>,
    pub role: ParticipantRole,
    pub photo_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RosterWarning {
    pub line: usize,
    pub code: &'static str,
    pub message: String,
}

/// Parses a registration roster with a `name,email,role[,photo_ref]` header.
/// Column order follows the header; unknown columns are ignored.
pub fn parse_roster(text: &str) -> (Vec<RosterRow>, Vec<RosterWarning>) {
    let mut rows = Vec::new();
    let mut warnings = Vec::new();

    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
        .filter(|(_, l)| !l.trim().is_empty());

    let Some((header_line, header)) = lines.next() else {
        return (rows, warnings);
    };
    let header: Vec<String> = parse_csv_record(header)
        .into_iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();
    let col = |name: &str| header.iter().position(|h| h == name);
    let (Some(name_col), email_col, role_col, photo_col) =
        (col("name"), col("email"), col("role"), col("photo_ref"))
    else {
        warnings.push(RosterWarning {
            line: header_line,
            code: "missing_column",
            message: "header must include a name column".to_string(),
        });
        return (rows, warnings);
    };

    for (line, raw) in lines {
        let fields = parse_csv_record(raw);
        let field = |idx: Option<usize>| {
            idx.and_then(|i| fields.get(i))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let Some(name) = field(Some(name_col)) else {
            warnings.push(RosterWarning {
                line,
                code: "missing_name",
                message: "row has no name".to_string(),
            });
            continue;
        };
        let role_raw = field(role_col).unwrap_or_default();
        let Some(role) = parse_role(&role_raw) else {
            warnings.push(RosterWarning {
                line,
                code: "bad_role",
                message: format!("unrecognized role value: {}", role_raw),
            });
            continue;
        };

        let email = field(email_col);
        if let Some(e) = email.as_deref() {
            if !is_valid_email(e) {
                warnings.push(RosterWarning {
                    line,
                    code: "bad_email",
                    message: format!("email is not valid: {}", e),
                });
                continue;
            }
        }

        rows.push(RosterRow {
            line,
            name,
            email,
            role,
            photo_ref: field(photo_col),
        });
    }

    (rows, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_record_handles_quotes_and_escaped_quotes() {
        assert_eq!(
            parse_csv_record(r#"a,"b, c","say ""hi""",,"#),
            vec!["a", "b, c", "say \"hi\"", "", ""]
        );
        assert_eq!(csv_quote("Pérez, Ana"), "\"Pérez, Ana\"");
        assert_eq!(csv_quote("plain"), "plain");
    }

    #[test]
    fn role_flag_strings_map_to_roles() {
        assert_eq!(parse_role("1"), Some(ParticipantRole::Distinguished));
        assert_eq!(parse_role(" 0 "), Some(ParticipantRole::Ordinary));
        assert_eq!(parse_role(""), Some(ParticipantRole::Ordinary));
        assert_eq!(parse_role("TRUE"), Some(ParticipantRole::Distinguished));
        assert_eq!(parse_role("2"), None);
    }

    #[test]
    fn roster_follows_header_order_and_reports_bad_rows() {
        let text = "email,name,role,photo_ref\r\n\
                    ana@example.com,\"Pérez, Ana\",1,photos/ana.jpg\r\n\
                    ,Luis,0,\r\n\
                    x@example.com,,0,\r\n\
                    y@example.com,Yolanda,maybe,\r\n";
        let (rows, warnings) = parse_roster(text);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "Pérez, Ana");
        assert_eq!(rows[0].role, ParticipantRole::Distinguished);
        assert_eq!(rows[0].photo_ref.as_deref(), Some("photos/ana.jpg"));
        assert_eq!(rows[1].email, None);
        assert_eq!(rows[1].role, ParticipantRole::Ordinary);

        let codes: Vec<(usize, &str)> = warnings.iter().map(|w| (w.line, w.code)).collect();
        assert_eq!(codes, vec![(4, "missing_name"), (5, "bad_role")]);
    }

    #[test]
    fn bad_email_skips_only_that_row() {
        let text = "name,email,role\n\
                    Ana,ana@example.org,1\n\
                    Bruno,bruno-at-example,0\n\
                    Carla,carla@example.org,0\n";
        let (rows, warnings) = parse_roster(text);
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Ana", "Carla"]);
        assert_eq!(warnings.len(), 1);
        assert_eq!((warnings[0].line, warnings[0].code), (3, "bad_email"));
    }

    #[test]
    fn email_shape_check() {
        assert!(is_valid_email("a@b"));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("@example.org"));
        assert!(!is_valid_email("ana@"));
        assert!(!is_valid_email("a@b@c"));
        assert!(!is_valid_email(&format!("{}@x.org", "a".repeat(EMAIL_MAX_LEN))));
    }

    #[test]
    fn roster_without_name_column_is_rejected() {
        let (rows, warnings) = parse_roster("email,role\nx@example.com,1\n");
        assert!(rows.is_empty());
        assert_eq!(warnings[0].code, "missing_column");
    }
}
