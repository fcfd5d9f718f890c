/// Display names for the CRM's task status codes.
const STATUS_NAMES: &[(&str, &str)] = &[
    ("1", "Новая"),
    ("2", "В работе"),
    ("3", "Выполняется"),
    ("4", "Ожидает контроля"),
    ("5", "Завершена"),
    ("6", "Отложена"),
    ("7", "Отклонена"),
];

pub fn status_name(code: &str) -> String {
    let code = code.trim();
    STATUS_NAMES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("status {code}"))
}

pub fn is_terminal(code: Option<&str>, terminal: &[String]) -> bool {
    code.is_some_and(|c| terminal.iter().any(|t| t.trim() == c.trim()))
}
