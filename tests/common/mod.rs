use assert_cmd::Command;

pub fn taskwatch_bin() -> Command {
    #[allow(deprecated)]
    {
        Command::cargo_bin("taskwatch").expect("taskwatch test binary should build")
    }
}

/// Binary pointed at a throwaway database and a config file that does not exist.
pub fn admin_bin(db_path: &std::path::Path) -> Command {
    let mut cmd = taskwatch_bin();
    cmd.env("DATABASE_PATH", db_path)
        .env_remove("BITRIX24_DOMAIN")
        .env_remove("BITRIX24_WEBHOOK_TOKEN")
        .env_remove("TELEGRAM_BOT_TOKEN")
        .env_remove("TELEGRAM_GROUP_ID")
        .args(["--config", "/nonexistent/taskwatch.toml"]);
    cmd
}
