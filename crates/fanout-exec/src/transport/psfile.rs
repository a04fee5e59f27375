//! File transfer for PowerShell targets
//!
//! There is no file channel on WinRM, and SSH servers with a PowerShell
//! login shell cannot be fed through `cat`. Both move files as base64 text
//! carried inside encoded PowerShell scripts.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use super::{remote_basename, walk_local};
use crate::connection::Connection;
use crate::error::{ExecError, FileCode};
use crate::result::CommandOutput;
use crate::shell::powershell::{encode_command, quote};

// Raw bytes per script; keeps the encoded command below the 8191
// character limit of the Windows command line.
const UPLOAD_CHUNK: usize = 1500;

async fn run(conn: &mut dyn Connection, script: &str) -> Result<CommandOutput, ExecError> {
    conn.execute(&encode_command(script), None).await
}

fn join_remote(base: &str, relative: &str) -> String {
    format!("{}\\{}", base.trim_end_matches(['\\', '/']), relative.replace('/', "\\"))
}

fn write_error(destination: &str, detail: impl std::fmt::Display) -> ExecError {
    ExecError::file(
        FileCode::Write,
        format!("Could not write file to {destination}: {detail}"),
    )
}

fn download_error(source: &str, detail: impl std::fmt::Display) -> ExecError {
    ExecError::file(
        FileCode::Download,
        format!("Could not download '{source}': {detail}"),
    )
}

/// Script writing one chunk of a file; the first chunk truncates
fn chunk_script(destination: &str, chunk: &[u8], first: bool) -> String {
    let path = quote(destination);
    let encoded = STANDARD.encode(chunk);
    if first {
        format!(
            "$bytes = [Convert]::FromBase64String('{encoded}')\n\
             [IO.File]::WriteAllBytes({path}, $bytes)\n"
        )
    } else {
        format!(
            "$bytes = [Convert]::FromBase64String('{encoded}')\n\
             $stream = [IO.File]::Open({path}, [IO.FileMode]::Append)\n\
             try {{ $stream.Write($bytes, 0, $bytes.Length) }} finally {{ $stream.Close() }}\n"
        )
    }
}

async fn upload_file(
    conn: &mut dyn Connection,
    source: &Path,
    destination: &str,
) -> Result<(), ExecError> {
    let content = tokio::fs::read(source)
        .await
        .map_err(|e| write_error(destination, format!("{}: {e}", source.display())))?;

    let mut chunks: Vec<&[u8]> = content.chunks(UPLOAD_CHUNK).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    for (index, chunk) in chunks.into_iter().enumerate() {
        let output = run(conn, &chunk_script(destination, chunk, index == 0)).await?;
        if !output.success() {
            return Err(write_error(destination, output.error_message()));
        }
    }
    Ok(())
}

/// Copy a local file or directory to `destination`
///
/// # Errors
/// Returns `WRITE_ERROR` if any part of the copy fails
pub async fn upload(
    conn: &mut dyn Connection,
    source: &Path,
    destination: &str,
) -> Result<(), ExecError> {
    debug!(source = %source.display(), destination = %destination, "uploading over PowerShell");

    if !source.is_dir() {
        return upload_file(conn, source, destination).await;
    }

    let (dirs, files) = walk_local(source).map_err(|e| write_error(destination, e))?;
    let mut all_dirs = vec![destination.to_string()];
    all_dirs.extend(dirs.iter().map(|d| join_remote(destination, d)));
    let list = all_dirs.iter().map(|d| quote(d)).collect::<Vec<_>>().join(",");
    let output = run(
        conn,
        &format!("New-Item -ItemType Directory -Force -Path {list} | Out-Null\n"),
    )
    .await?;
    if !output.success() {
        return Err(write_error(destination, output.error_message()));
    }

    for file in &files {
        upload_file(conn, &source.join(file), &join_remote(destination, file)).await?;
    }
    Ok(())
}

async fn fetch_file(
    conn: &mut dyn Connection,
    source: &str,
    destination: &Path,
) -> Result<(), ExecError> {
    let script = format!(
        "[Convert]::ToBase64String([IO.File]::ReadAllBytes({}))\n",
        quote(source)
    );
    let output = run(conn, &script).await?;
    if !output.success() {
        return Err(download_error(source, output.error_message()));
    }
    let content = STANDARD
        .decode(output.stdout_str().trim())
        .map_err(|e| download_error(source, e))?;
    tokio::fs::write(destination, content)
        .await
        .map_err(|e| download_error(source, e))
}

/// Copy a remote file or directory into the local directory `destination`
///
/// # Errors
/// Returns `DOWNLOAD_ERROR` if any part of the copy fails
pub async fn download(
    conn: &mut dyn Connection,
    source: &str,
    destination: &Path,
) -> Result<(), ExecError> {
    debug!(source = %source, destination = %destination.display(), "downloading over PowerShell");

    tokio::fs::create_dir_all(destination)
        .await
        .map_err(|e| download_error(source, e))?;
    let local = destination.join(remote_basename(source));

    let quoted = quote(source);
    let probe = format!(
        "if (Test-Path -LiteralPath {quoted} -PathType Container) {{ 'dir' }} \
         elseif (Test-Path -LiteralPath {quoted}) {{ 'file' }} \
         else {{ exit 1 }}\n"
    );
    let output = run(conn, &probe).await?;
    if !output.success() {
        return Err(download_error(source, "no such file or directory"));
    }
    if output.stdout_str().trim() == "file" {
        return fetch_file(conn, source, &local).await;
    }

    let listing = format!(
        "$root = (Resolve-Path -LiteralPath {quoted}).ProviderPath\n\
         Get-ChildItem -LiteralPath $root -Recurse -Force | ForEach-Object {{\n\
         \x20 $rel = $_.FullName.Substring($root.Length).TrimStart('\\')\n\
         \x20 if ($_.PSIsContainer) {{ \"d $rel\" }} else {{ \"f $rel\" }}\n\
         }}\n"
    );
    let output = run(conn, &listing).await?;
    if !output.success() {
        return Err(download_error(source, output.error_message()));
    }

    tokio::fs::create_dir_all(&local)
        .await
        .map_err(|e| download_error(source, e))?;
    let listing = output.stdout_str();
    for entry in listing.lines().map(str::trim_end) {
        let Some((kind, rel)) = entry.split_once(' ') else {
            continue;
        };
        let local_path = rel.split('\\').fold(local.clone(), |path, part| path.join(part));
        match kind {
            "d" => tokio::fs::create_dir_all(&local_path)
                .await
                .map_err(|e| download_error(source, e))?,
            "f" => {
                if let Some(parent) = local_path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| download_error(source, e))?;
                }
                fetch_file(conn, &join_remote(source, rel), &local_path).await?;
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote(r"C:\Temp\", "a/b.txt"), r"C:\Temp\a\b.txt");
        assert_eq!(join_remote(r"C:\Temp", "c.txt"), r"C:\Temp\c.txt");
    }

    #[test]
    fn test_first_chunk_truncates() {
        let script = chunk_script(r"C:\Temp\it's.txt", b"hi", true);
        assert!(script.contains("FromBase64String('aGk=')"));
        assert!(script.contains(r"WriteAllBytes('C:\Temp\it''s.txt', $bytes)"));
    }

    #[test]
    fn test_later_chunks_append() {
        let script = chunk_script(r"C:\a.bin", b"x", false);
        assert!(script.contains("[IO.FileMode]::Append"));
        assert!(!script.contains("WriteAllBytes"));
    }

    #[test]
    fn test_chunked_command_fits_command_line() {
        let script = chunk_script(r"C:\Users\deploy\AppData\Local\Temp\abc\file.bin", &[0xAB; UPLOAD_CHUNK], false);
        assert!(encode_command(&script).len() < 8191);
    }
}
