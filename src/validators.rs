//! Input validation and sanitization functions
//!
//! Field-level syntax checks shared by group rules, machine rules and
//! instance network settings. Every function returns `Err(String)` with a
//! human-readable reason; the core maps it to a validation error naming
//! the offending field.

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Maximum length of descriptions and comments
pub const MAX_COMMENT_LEN: usize = 256;

/// Maximum length of group names
pub const MAX_NAME_LEN: usize = 64;

/// Connection-tracking states accepted by `-m state --state`
pub const CONNTRACK_STATES: [&str; 5] = ["NEW", "ESTABLISHED", "RELATED", "INVALID", "UNTRACKED"];

/// Sanitizes a free-text description or comment for safe use in command previews.
///
/// Keeps printable ASCII only, drops quotes and backslashes, and truncates to
/// [`MAX_COMMENT_LEN`] characters.
///
/// # Examples
///
/// ```
/// use vpnpolicy::validators::sanitize_comment;
///
/// assert_eq!(sanitize_comment("allow web"), "allow web");
/// assert_eq!(sanitize_comment("say \"hi\"\n"), "say hi");
/// ```
pub fn sanitize_comment(input: &str) -> String {
    input
        .chars()
        .filter(|c| (c.is_ascii_graphic() || *c == ' ') && !matches!(c, '"' | '\'' | '\\' | '`'))
        .take(MAX_COMMENT_LEN)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Validates a group name.
///
/// # Errors
///
/// Returns `Err` if the name is empty, longer than [`MAX_NAME_LEN`], or
/// contains characters other than ASCII alphanumerics, space, `-`, `_` and `.`.
pub fn validate_name(input: &str) -> Result<String, String> {
    let name = input.trim();
    if name.is_empty() {
        return Err("Name cannot be empty".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!("Name too long (max {MAX_NAME_LEN} characters)"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
    {
        return Err("Name contains invalid characters".to_string());
    }
    Ok(name.to_string())
}

/// Turns a display name into an identifier fragment: lowercase, spaces to `_`.
pub fn slugify(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range written as `start:end`.
///
/// # Errors
///
/// Returns `Err` if either port is 0 or `start` is not strictly below `end`.
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start >= end {
        Err("Start port must be less than end port".to_string())
    } else {
        Ok((start, end))
    }
}

fn parse_port_number(text: &str) -> Result<u16, String> {
    if text.is_empty() || text.len() > 5 || !text.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("'{text}' is not a port number"));
    }
    let value: u32 = text
        .parse()
        .map_err(|_| format!("'{text}' is not a port number"))?;
    let port = u16::try_from(value).map_err(|_| format!("Port {value} is out of range (1-65535)"))?;
    validate_port(port)
}

/// Parses a port specification into inclusive `(start, end)` pairs.
///
/// Accepts a single port (`443`), a range (`1000:2000`), or a comma list of
/// either (`80,443,8000:8080`).
///
/// # Errors
///
/// Returns `Err` on empty input, non-numeric entries, ports outside
/// 1-65535, or ranges whose start is not below their end.
///
/// # Examples
///
/// ```
/// use vpnpolicy::validators::parse_port_spec;
///
/// assert_eq!(parse_port_spec("443").unwrap(), vec![(443, 443)]);
/// assert_eq!(parse_port_spec("1000:2000").unwrap(), vec![(1000, 2000)]);
/// assert!(parse_port_spec("2000:1000").is_err());
/// assert!(parse_port_spec("0").is_err());
/// ```
pub fn parse_port_spec(input: &str) -> Result<Vec<(u16, u16)>, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("Port cannot be empty".to_string());
    }

    input
        .split(',')
        .map(str::trim)
        .map(|entry| match entry.split_once(':') {
            Some((start, end)) => {
                let start = parse_port_number(start)?;
                let end = parse_port_number(end)?;
                validate_port_range(start, end)
            }
            None => parse_port_number(entry).map(|p| (p, p)),
        })
        .collect()
}

/// Parses a dotted-quad IPv4 address optionally followed by `/0..32`.
///
/// A bare address becomes a `/32` network.
///
/// # Errors
///
/// Returns `Err` if the address or prefix is malformed.
///
/// # Examples
///
/// ```
/// use vpnpolicy::validators::parse_ipv4_network;
///
/// assert_eq!(parse_ipv4_network("10.0.0.1").unwrap().prefix(), 32);
/// assert_eq!(parse_ipv4_network("10.8.0.0/24").unwrap().prefix(), 24);
/// assert!(parse_ipv4_network("10.8.0.0/33").is_err());
/// assert!(parse_ipv4_network("10.8.0").is_err());
/// ```
pub fn parse_ipv4_network(input: &str) -> Result<Ipv4Network, String> {
    let input = input.trim();
    let (addr_text, prefix_text) = match input.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (input, None),
    };

    let addr = parse_ipv4(addr_text)?;

    let prefix = match prefix_text {
        Some(text) => {
            if text.is_empty() || text.len() > 2 || !text.chars().all(|c| c.is_ascii_digit()) {
                return Err(format!("'{text}' is not a valid prefix length"));
            }
            let prefix: u8 = text
                .parse()
                .map_err(|_| format!("'{text}' is not a valid prefix length"))?;
            if prefix > 32 {
                return Err(format!("Prefix length {prefix} exceeds 32"));
            }
            prefix
        }
        None => 32,
    };

    Ipv4Network::new(addr, prefix).map_err(|e| e.to_string())
}

/// Parses a strict dotted-quad IPv4 literal.
///
/// # Errors
///
/// Returns `Err` if the text is not four decimal octets.
pub fn parse_ipv4(input: &str) -> Result<Ipv4Addr, String> {
    input
        .trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| format!("'{}' is not a valid IPv4 address", input.trim()))
}

/// Validates a network interface name for iptables `-i`/`-o`.
///
/// Linux kernel interface name rules plus the iptables wildcard:
/// - Max 15 characters (IFNAMSIZ - 1), not counting a trailing `+`
/// - Alphanumeric, dot, dash, underscore only
/// - A single trailing `+` matches every interface with that prefix
///
/// # Errors
///
/// Returns `Err` if the name violates these constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    let name = name.trim();
    let stem = name.strip_suffix('+').unwrap_or(name);

    if stem.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if stem.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if stem == "." || stem == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Normalizes a comma list of connection-tracking states.
///
/// # Errors
///
/// Returns `Err` if the list is empty or names an unknown state.
///
/// # Examples
///
/// ```
/// use vpnpolicy::validators::parse_conntrack_states;
///
/// assert_eq!(
///     parse_conntrack_states("related, established").unwrap(),
///     "RELATED,ESTABLISHED"
/// );
/// assert!(parse_conntrack_states("SYN").is_err());
/// ```
pub fn parse_conntrack_states(input: &str) -> Result<String, String> {
    let mut states: Vec<String> = Vec::new();
    for raw in input.split(',') {
        let state = raw.trim().to_uppercase();
        if state.is_empty() {
            continue;
        }
        if !CONNTRACK_STATES.contains(&state.as_str()) {
            return Err(format!(
                "Unknown state '{state}' (valid: {})",
                CONNTRACK_STATES.join(", ")
            ));
        }
        if !states.contains(&state) {
            states.push(state);
        }
    }

    if states.is_empty() {
        return Err("State list cannot be empty".to_string());
    }
    Ok(states.join(","))
}
