use anyhow::{Result, bail};
use std::io::{self, BufRead, IsTerminal};
use zeroize::Zeroizing;

const PASSWORD_ENV: &str = "BACKVAULT_PASSWORD";

fn password_from_env() -> Option<Zeroizing<String>> {
    //  BACKVAULT_PASSWORD="supersecret" backvault backup
    match std::env::var(PASSWORD_ENV) {
        Ok(pw) if !pw.is_empty() => Some(Zeroizing::new(pw)),
        _ => None,
    }
}

/// Password for an existing salt: env var, then piped stdin, then a prompt.
pub fn read_password() -> Result<Zeroizing<String>> {
    if let Some(pw) = password_from_env() {
        return Ok(pw);
    }

    //  printf "%s" "$PW" | backvault restore --archive ...
    if !io::stdin().is_terminal() {
        let mut buf = Zeroizing::new(String::new());
        io::stdin().read_line(&mut buf)?;
        trim_newline(&mut buf);

        if !buf.is_empty() {
            return Ok(buf);
        }
    }

    if io::stdin().is_terminal() {
        let pw = Zeroizing::new(rpassword::prompt_password("Password: ")?);
        if !pw.is_empty() {
            return Ok(pw);
        }
    }

    bail!("No password provided")
}

/// Password for a new salt; interactive input must be typed twice.
pub fn read_new_password_with_confirmation() -> Result<Zeroizing<String>> {
    if let Some(pw) = password_from_env() {
        return Ok(pw);
    }

    let (pw1, pw2) = if io::stdin().is_terminal() {
        (
            Zeroizing::new(rpassword::prompt_password("New password: ")?),
            Zeroizing::new(rpassword::prompt_password("Confirm password: ")?),
        )
    } else {
        let stdin = io::stdin();
        let mut handle = stdin.lock();

        let mut pw1 = Zeroizing::new(String::new());
        let mut pw2 = Zeroizing::new(String::new());
        handle.read_line(&mut pw1)?;
        handle.read_line(&mut pw2)?;
        trim_newline(&mut pw1);
        trim_newline(&mut pw2);
        (pw1, pw2)
    };

    if pw1.is_empty() {
        bail!("password cannot be empty");
    }

    if pw1 != pw2 {
        bail!("passwords do not match");
    }

    Ok(pw1)
}

fn trim_newline(s: &mut String) {
    while s.ends_with('\n') || s.ends_with('\r') {
        s.pop();
    }
}
