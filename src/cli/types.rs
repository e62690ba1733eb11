use crate::device::constants::{COMMAND_ONE, COMMAND_TWO};

pub const HELP: &str = "Commands: scan | stop | send <code> | one | two | status | quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    Scan,
    Stop,
    Send(u16),
    Status,
    Quit,
}

/// Accepts decimal or `0x` prefixed hexadecimal.
pub fn parse_code(input: &str) -> Option<u16> {
    let input = input.trim();
    match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => input.parse().ok(),
    }
}

pub fn parse_user_command(line: &str) -> Result<UserCommand, String> {
    let mut words = line.split_whitespace();
    let command = words.next().map(|word| word.to_lowercase());

    let result = match command.as_deref() {
        Some("scan") | Some("connect") => UserCommand::Scan,
        Some("stop") => UserCommand::Stop,
        Some("one") => UserCommand::Send(COMMAND_ONE),
        Some("two") => UserCommand::Send(COMMAND_TWO),
        Some("status") => UserCommand::Status,
        Some("quit") | Some("exit") => UserCommand::Quit,
        Some("send") => {
            let code = words.next().ok_or_else(|| "Usage: send <code>".to_string())?;
            let code = parse_code(code).ok_or_else(|| format!("Invalid command code {:?}", code))?;
            UserCommand::Send(code)
        },
        Some(other) => return Err(format!("Unknown command {:?}. {}", other, HELP)),
        None => return Err(HELP.to_string()),
    };

    Ok(result)
}
