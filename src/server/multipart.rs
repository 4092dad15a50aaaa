/*!
Minimal multipart/form-data decoder for group uploads.

Parts are split on the boundary delimiter; each part's Content-Disposition supplies the
field name and, for file parts, the client filename. Part bodies are kept as raw bytes.
*/

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub data: Vec<u8>,
}

/// Extract the `boundary` parameter from a multipart Content-Type value.
pub fn boundary_from_content_type(ctype: &str) -> Option<String> {
    ctype.split(';').skip(1).find_map(|param| {
        let (k, v) = param.trim().split_once('=')?;
        if k.trim().eq_ignore_ascii_case("boundary") {
            let v = strip_quotes(v.trim());
            (!v.is_empty()).then(|| v.to_string())
        } else {
            None
        }
    })
}

pub fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<Part>, String> {
    let delim = format!("--{boundary}").into_bytes();
    let mut parts = Vec::new();

    let mut pos = find(body, &delim, 0).ok_or("multipart boundary not found")?;
    loop {
        pos += delim.len();
        if body[pos..].starts_with(b"--") {
            return Ok(parts);
        }
        pos = skip_line_end(body, pos);

        let hdr_end = find(body, b"\r\n\r\n", pos).ok_or("unterminated multipart part headers")?;
        let headers = String::from_utf8_lossy(&body[pos..hdr_end]).into_owned();
        let data_start = hdr_end + 4;

        let mut closing = b"\r\n".to_vec();
        closing.extend_from_slice(&delim);
        let data_end = find(body, &closing, data_start).ok_or("unterminated multipart part")?;

        let (name, filename) = disposition(&headers).ok_or("multipart part without name")?;
        parts.push(Part {
            name,
            filename,
            data: body[data_start..data_end].to_vec(),
        });
        pos = data_end + 2;
    }
}

/// Field name and optional filename from the part's Content-Disposition header.
/// Extended `name*=utf-8''...` values (RFC 5987) take precedence over plain ones.
fn disposition(headers: &str) -> Option<(String, Option<String>)> {
    let line = headers.lines().find(|l| {
        l.split_once(':')
            .map(|(k, _)| k.trim().eq_ignore_ascii_case("content-disposition"))
            .unwrap_or(false)
    })?;
    let value = line.split_once(':')?.1;
    let (mut name, mut filename) = (None, None);
    let (mut name_ext, mut filename_ext) = (None, None);
    for param in value.split(';').skip(1) {
        if let Some((k, v)) = param.trim().split_once('=') {
            let v = strip_quotes(v.trim());
            match k.trim().to_ascii_lowercase().as_str() {
                "name" => name = Some(v.to_string()),
                "filename" => filename = Some(v.to_string()),
                "name*" => name_ext = decode_ext_value(v),
                "filename*" => filename_ext = decode_ext_value(v),
                _ => {}
            }
        }
    }
    Some((name_ext.or(name)?, filename_ext.or(filename)))
}

/// `charset'lang'pct-encoded` → decoded text (UTF-8 assumed).
fn decode_ext_value(v: &str) -> Option<String> {
    let mut it = v.splitn(3, '\'');
    let (_charset, _lang, encoded) = (it.next()?, it.next()?, it.next()?);
    Some(String::from_utf8_lossy(&urlencoding::decode_binary(encoded.as_bytes())).into_owned())
}

fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn skip_line_end(body: &[u8], pos: usize) -> usize {
    if body[pos..].starts_with(b"\r\n") {
        pos + 2
    } else if body[pos..].starts_with(b"\n") {
        pos + 1
    } else {
        pos
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}
