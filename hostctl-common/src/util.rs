//! Shared utilities for hostctl.

fn find_value_end(s: &str) -> usize {
    let mut end = 0;
    let mut in_quote = None;
    let mut escaped = false;

    for c in s.chars() {
        let char_len = c.len_utf8();

        if escaped {
            escaped = false;
            end += char_len;
            continue;
        }

        if c == '\\' {
            escaped = true;
            end += char_len;
            continue;
        }

        if let Some(q) = in_quote {
            if c == q {
                in_quote = None;
            }
            end += char_len;
            continue;
        }

        if c == '"' || c == '\'' {
            in_quote = Some(c);
            end += char_len;
            continue;
        }

        if c.is_whitespace() {
            break;
        }

        end += char_len;
    }
    end
}

/// Keys whose value is replaced with `***` before a command is logged.
const SECRET_KEYS: &[&str] = &[
    "OS_PASSWORD=",
    "OS_AUTH_TOKEN=",
    "PASSWORD=",
    "TOKEN=",
    "--os-password ",
    "--os-password=",
    "--password ",
    "--password=",
    "--admin-password ",
    "--admin-password=",
    "--token ",
    "--token=",
];

/// Mask credentials in a command line before logging it.
///
/// Platform CLIs take passwords both as `OS_PASSWORD=...` environment
/// prefixes and as `--os-password` flags; both forms are covered.
pub fn mask_sensitive_command(cmd: &str) -> String {
    let mut result = cmd.to_string();
    for key in SECRET_KEYS {
        let replacement = format!("{key}***");
        // Track search position; the replacement itself contains the key.
        let mut search_start = 0;
        while search_start < result.len() {
            let Some(start) = result[search_start..].find(key) else {
                break;
            };
            let abs_start = search_start + start;
            let value_start = abs_start + key.len();
            let value_end = value_start + find_value_end(&result[value_start..]);

            if &result[value_start..value_end] != "***" {
                result = format!("{}{}{}", &result[..abs_start], replacement, &result[value_end..]);
            }
            search_start = abs_start + replacement.len();
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_env_prefix_and_flags() {
        let cmd = "OS_PASSWORD=Li69nux* openstack --os-password hunter2 server list";
        let masked = mask_sensitive_command(cmd);
        assert_eq!(masked, "OS_PASSWORD=*** openstack --os-password *** server list");
    }

    #[test]
    fn test_mask_multiple_occurrences() {
        assert_eq!(mask_sensitive_command("TOKEN=a TOKEN=b"), "TOKEN=*** TOKEN=***");
    }

    #[test]
    fn test_mask_quoted_value() {
        let masked = mask_sensitive_command("PASSWORD=\"my secret\" system host-list");
        assert_eq!(masked, "PASSWORD=*** system host-list");
    }

    #[test]
    fn test_plain_command_untouched() {
        assert_eq!(
            mask_sensitive_command("system host-lock compute-0"),
            "system host-lock compute-0"
        );
    }
}
