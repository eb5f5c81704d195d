const ILLEGAL: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Turn a page title into a name safe for use as an output folder.
/// Illegal filesystem characters become underscores, runs of underscores
/// collapse to one, and edge underscores are trimmed.
pub fn safe_folder_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_us = false;
    for ch in name.trim().chars() {
        if ILLEGAL.contains(&ch) || ch == '_' {
            if !last_us {
                out.push('_');
                last_us = true;
            }
        } else {
            out.push(ch);
            last_us = false;
        }
    }
    out.trim_matches('_').to_string()
}
