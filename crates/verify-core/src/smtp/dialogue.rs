//! Byte-level SMTP client dialogue over any `AsyncRead + AsyncWrite` stream.
//!
//! Kept generic over the stream type so tests can drive the exact same
//! state machine over an in-memory `tokio::io::duplex` pair instead of a
//! real `TcpStream` (§4.3 "Connect" through "second RCPT TO").

use common::AppError;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::classify::SmtpResponse;

/// Outcome of a full probe conversation: the primary RCPT TO response for
/// the email under test, plus a second RCPT TO response against a random
/// local part at the same domain for catch-all detection (§4.3 step 5).
#[derive(Debug, Clone)]
pub struct ConverseResult {
    pub greeting: SmtpResponse,
    pub mail_from: SmtpResponse,
    pub rcpt_primary: SmtpResponse,
    pub rcpt_catch_all: Option<SmtpResponse>,
}

async fn read_response<R>(reader: &mut BufReader<R>) -> Result<SmtpResponse, AppError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut code = 0u16;
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| AppError::Smtp(format!("read error: {e}")))?;
        if n == 0 {
            return Err(AppError::Smtp("connection closed by peer".into()));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() < 4 {
            return Err(AppError::Smtp(format!("malformed response line: {line:?}")));
        }
        code = line[..3]
            .parse()
            .map_err(|_| AppError::Smtp(format!("malformed response code: {line:?}")))?;
        let sep = line.as_bytes()[3];
        lines.push(line[4.min(line.len())..].to_string());
        if sep == b' ' {
            break;
        }
    }
    Ok(SmtpResponse { code, message: lines.join(" ") })
}

async fn send_command<W>(writer: &mut W, command: &str) -> Result<(), AppError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{command}\r\n").as_bytes())
        .await
        .map_err(|e| AppError::Smtp(format!("write error: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| AppError::Smtp(format!("flush error: {e}")))
}

fn random_local_part() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let s: String = (0..12)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect();
    format!("verify-probe-{s}")
}

/// Runs the full dialogue against an already-connected stream: greeting,
/// EHLO, MAIL FROM, RCPT TO the target, then RSET/MAIL FROM/RCPT TO a
/// random local part at the same domain, then QUIT.
///
/// Stops early (catch-all left `None`) if the primary RCPT TO was not
/// accepted — there is nothing to compare a catch-all response against.
pub async fn converse<S>(
    stream: S,
    helo_host: &str,
    sender: &str,
    recipient: &str,
) -> Result<ConverseResult, AppError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let greeting = read_response(&mut reader).await?;

    send_command(&mut write_half, &format!("EHLO {helo_host}")).await?;
    let ehlo = read_response(&mut reader).await?;
    if !ehlo.is_success() {
        send_command(&mut write_half, &format!("HELO {helo_host}")).await?;
        let _ = read_response(&mut reader).await?;
    }

    send_command(&mut write_half, &format!("MAIL FROM:<{sender}>")).await?;
    let mail_from = read_response(&mut reader).await?;

    let rcpt_primary = if mail_from.is_success() {
        send_command(&mut write_half, &format!("RCPT TO:<{recipient}>")).await?;
        read_response(&mut reader).await?
    } else {
        mail_from.clone()
    };

    let rcpt_catch_all = if mail_from.is_success() && rcpt_primary.is_success() {
        let domain = recipient.rsplit_once('@').map(|(_, d)| d).unwrap_or("");
        let probe_address = format!("{}@{domain}", random_local_part());

        send_command(&mut write_half, "RSET").await?;
        let _ = read_response(&mut reader).await?;
        send_command(&mut write_half, &format!("MAIL FROM:<{sender}>")).await?;
        let second_mail_from = read_response(&mut reader).await?;
        if second_mail_from.is_success() {
            send_command(&mut write_half, &format!("RCPT TO:<{probe_address}>")).await?;
            Some(read_response(&mut reader).await?)
        } else {
            None
        }
    } else {
        None
    };

    let _ = send_command(&mut write_half, "QUIT").await;

    Ok(ConverseResult { greeting, mail_from, rcpt_primary, rcpt_catch_all })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    async fn server_script(mut sock: tokio::io::DuplexStream, lines: Vec<&'static str>) {
        for line in lines {
            let _ = sock.write_all(format!("{line}\r\n").as_bytes()).await;
        }
    }

    #[tokio::test]
    async fn full_accept_with_catch_all() {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(server_script(
            server,
            vec![
                "220 mx.example.com ESMTP",
                "250 mx.example.com Hello",
                "250 2.1.0 Sender OK",
                "250 2.1.5 Recipient OK",
                "250 2.0.0 Reset OK",
                "250 2.1.0 Sender OK",
                "250 2.1.5 Recipient OK",
            ],
        ));

        let result = converse(client, "prober.local", "probe@prober.local", "user@example.com")
            .await
            .unwrap();
        assert!(result.rcpt_primary.is_success());
        assert!(result.rcpt_catch_all.unwrap().is_success());
    }

    #[tokio::test]
    async fn permanent_rejection_skips_catch_all() {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(server_script(
            server,
            vec![
                "220 mx.example.com ESMTP",
                "250 mx.example.com Hello",
                "250 2.1.0 Sender OK",
                "550 5.1.1 No such user here",
            ],
        ));

        let result = converse(client, "prober.local", "probe@prober.local", "nobody@example.com")
            .await
            .unwrap();
        assert!(!result.rcpt_primary.is_success());
        assert!(result.rcpt_catch_all.is_none());
    }
}
