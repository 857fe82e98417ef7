//! String command protocol used by [`Model::send_command`](super::Model::send_command).
//!
//! A command is a whitespace separated token list such as `"binary true"`.
//! The target is `"all"`, a class name or an instance name.

pub const SEND_TO_ALL: &str = "all";

pub fn split_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(str::to_string).collect()
}

pub fn is_command_target(send_to: &str, class_name: &str, name: &str) -> bool {
    send_to == SEND_TO_ALL || send_to == class_name || send_to == name
}

/// Parses `<key> <bool>` commands. Returns `None` when `args` is a different
/// command or the value is not a recognised boolean.
pub fn parse_bool_command(args: &[String], key: &str) -> Option<bool> {
    if args.len() < 2 || args[0] != key {
        return None;
    }
    match args[1].as_str() {
        "true" | "on" | "1" => Some(true),
        "false" | "off" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_collapses_whitespace() {
        assert_eq!(split_command("  binary \t true "), vec!["binary", "true"]);
        assert!(split_command("").is_empty());
    }

    #[test]
    fn test_targets() {
        assert!(is_command_target("all", "DenseAffine", "fc1"));
        assert!(is_command_target("DenseAffine", "DenseAffine", "fc1"));
        assert!(is_command_target("fc1", "DenseAffine", "fc1"));
        assert!(!is_command_target("Convolution", "DenseAffine", "fc1"));
    }

    #[test]
    fn test_parse_bool_command() {
        let args = split_command("binary true");
        assert_eq!(parse_bool_command(&args, "binary"), Some(true));
        assert_eq!(parse_bool_command(&split_command("binary off"), "binary"), Some(false));
        assert_eq!(parse_bool_command(&args, "host_only"), None);
        assert_eq!(parse_bool_command(&split_command("binary maybe"), "binary"), None);
        assert_eq!(parse_bool_command(&split_command("binary"), "binary"), None);
    }
}
