/// Rewrites `?` placeholders into the numbered `$1..$n` form Postgres
/// expects.
///
/// Question marks inside single-quoted literals and double-quoted identifiers
/// are not placeholders and are left untouched. A doubled quote inside a
/// literal (`''`) closes and immediately reopens the quoted state, which
/// reads the escape correctly without tracking it separately.
pub(crate) fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut next = 0u32;
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match quote {
            Some(open) => {
                if c == open {
                    quote = None;
                }
                out.push(c);
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    out.push(c);
                }
                '?' => {
                    next += 1;
                    out.push('$');
                    out.push_str(&next.to_string());
                }
                _ => out.push(c),
            },
        }
    }
    out
}
