//! PowerShell command construction for Windows targets
//!
//! Every script is sent as `powershell.exe -EncodedCommand <base64 UTF-16LE>`
//! so no quoting survives the trip through the remote command processor.

use std::collections::BTreeSet;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{ExecError, FileCode};
use crate::result::CommandOutput;
use crate::target::Target;

/// Script extensions runnable without extra configuration
pub const DEFAULT_EXTENSIONS: [&str; 3] = [".ps1", ".rb", ".pp"];

const SHELL_INIT: &str = r#"$installRegKey = Get-ItemProperty -Path "HKLM:\Software\Puppet Labs\Puppet" -ErrorAction 0
if(![string]::IsNullOrEmpty($installRegKey.RememberedInstallDir64)){
  $puppetBaseDir = $installRegKey.RememberedInstallDir64
}elseif(![string]::IsNullOrEmpty($installRegKey.RememberedInstallDir)){
  $puppetBaseDir = $installRegKey.RememberedInstallDir
}else{
  $puppetBaseDir = "${ENV:ProgramFiles}\Puppet Labs\Puppet"
}

$ENV:PATH += ";${puppetBaseDir}\bin\;" +
"${puppetBaseDir}\puppet\bin;" +
"${puppetBaseDir}\sys\ruby\bin\"
$ENV:RUBYLIB = "${puppetBaseDir}\puppet\lib;" +
"${puppetBaseDir}\facter\lib;" +
"${puppetBaseDir}\hiera\lib;" +
$ENV:RUBYLIB

function ConvertFrom-PSCustomObject
{
PARAM([Parameter(ValueFromPipeline = $true)] $InputObject)
PROCESS {
  if ($null -eq $InputObject) { return $null }
  if ($InputObject -is [System.Collections.IEnumerable] -and $InputObject -isnot [string]) {
    $collection = @(
      foreach ($object in $InputObject) { ConvertFrom-PSCustomObject $object }
    )

    $collection
  } elseif ($InputObject -is [System.Management.Automation.PSCustomObject]) {
    $hash = @{}
    foreach ($property in $InputObject.PSObject.Properties) {
      $hash[$property.Name] = ConvertFrom-PSCustomObject $property.Value
    }

    $hash
  } else {
    $InputObject
  }
}
}

function Get-ContentAsJson
{
[CmdletBinding()]
PARAM(
  [Parameter(Mandatory = $true)] $Text,
  [Parameter(Mandatory = $false)] [Text.Encoding] $Encoding = [Text.Encoding]::UTF8
)

$Text | ConvertFrom-Json | ConvertFrom-PSCustomObject
}
"#;

/// Quote a string as a PowerShell single-quoted literal
#[must_use]
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Double-quote arguments containing spaces for `cmd.exe`-style programs
#[must_use]
pub fn escape_arguments(arguments: &[String]) -> Vec<String> {
    arguments
        .iter()
        .map(|arg| {
            if arg.contains(' ') {
                format!("\"{arg}\"")
            } else {
                arg.clone()
            }
        })
        .collect()
}

/// Whether `path` is a PowerShell script
#[must_use]
pub fn is_powershell_file(path: &str) -> bool {
    extension(path).is_some_and(|ext| ext == ".ps1")
}

/// Program and arguments that run `path` based on its extension
#[must_use]
pub fn process_from_extension(path: &str) -> (String, Vec<String>) {
    let quoted = format!("\"{path}\"");
    match extension(path).as_deref() {
        Some(".rb") => ("ruby.exe".to_string(), vec!["-S".to_string(), quoted]),
        Some(".ps1") => (
            "powershell.exe".to_string(),
            [
                "-NoProfile",
                "-NonInteractive",
                "-NoLogo",
                "-ExecutionPolicy",
                "Bypass",
                "-File",
            ]
            .iter()
            .map(ToString::to_string)
            .chain(std::iter::once(quoted))
            .collect(),
        ),
        Some(".pp") => ("puppet.bat".to_string(), vec!["apply".to_string(), quoted]),
        _ => ("cmd.exe".to_string(), vec!["/c".to_string(), quoted]),
    }
}

/// Wrap a PowerShell statement so console encodings are UTF-8 and the
/// process exits with the statement's exit code
#[must_use]
pub fn execute_process_snippet(command: &str) -> String {
    format!(
        r#"if ([Console]::InputEncoding -eq [System.Text.Encoding]::UTF8) {{
  [Console]::InputEncoding = New-Object System.Text.UTF8Encoding $False
}}
if ([Console]::OutputEncoding -eq [System.Text.Encoding]::UTF8) {{
  [Console]::OutputEncoding = New-Object System.Text.UTF8Encoding $False
}}
$OutputEncoding = [Console]::OutputEncoding
{command}
if (-not $? -and ($LASTEXITCODE -eq $null)) {{ exit 1 }}
exit $LASTEXITCODE
"#
    )
}

/// Run `path` with `arguments`, optionally piping `stdin` into it
#[must_use]
pub fn execute_process(path: &str, arguments: &[String], stdin: Option<&str>) -> String {
    let quoted_args = arguments.iter().map(|a| quote(a)).collect::<Vec<_>>().join(" ");
    let already_quoted = (path.starts_with('\'') && path.ends_with('\''))
        || (path.starts_with('"') && path.ends_with('"'));
    let quoted_path = if already_quoted && path.len() > 1 {
        path.to_string()
    } else {
        quote(path)
    };

    let exec_cmd = match stdin {
        None => format!("& {quoted_path} {quoted_args}"),
        Some(input) => format!("@'\n{input}\n'@ | & {quoted_path} {quoted_args}"),
    };
    execute_process_snippet(&exec_cmd)
}

/// Create a random directory under `parent` and print its path
#[must_use]
pub fn make_tempdir_snippet(parent: &str) -> String {
    format!(
        r"$parent = {parent}
$name = [System.IO.Path]::GetRandomFileName()
$path = Join-Path $parent $name -ErrorAction Stop
New-Item -ItemType Directory -Path $path -ErrorAction Stop | Out-Null
$path
"
    )
}

/// Remove a directory recursively
#[must_use]
pub fn rmdir_snippet(dir: &str) -> String {
    format!("Remove-Item -Force -Recurse -Path {}\n", quote(dir))
}

/// Create directories
#[must_use]
pub fn mkdirs_snippet(dirs: &[String]) -> String {
    let unique: BTreeSet<&String> = dirs.iter().collect();
    let list = unique.iter().map(|d| quote(d)).collect::<Vec<_>>().join(",");
    format!("New-Item -ItemType Directory -Force -Path {list} | Out-Null\n")
}

/// Invoke a `.ps1` script with positional arguments passed as here-strings
#[must_use]
pub fn run_script_snippet(arguments: &[String], script_path: &str) -> String {
    let arg_list = arguments
        .iter()
        .map(|a| format!("$invokeArgs.ArgumentList += @'\n{a}\n'@"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"$invokeArgs = @{{
  ScriptBlock = (Get-Command "{script_path}").ScriptBlock
  ArgumentList = @()
}}
{arg_list}

try
{{
  Invoke-Command @invokeArgs
}}
catch
{{
  Write-Error $_.Exception
  exit 1
}}
"#
    )
}

/// Call a `.ps1` task, splatting only the parameters it declares
#[must_use]
pub fn ps_task_snippet(path: &str, arguments: &serde_json::Value) -> String {
    let encoded = STANDARD.encode(arguments.to_string());
    format!(
        r#"$private:tempArgs = Get-ContentAsJson (
  [System.Text.Encoding]::UTF8.GetString([System.Convert]::FromBase64String('{encoded}'))
)
$allowedArgs = (Get-Command "{path}").Parameters.Keys
$private:taskArgs = @{{}}
$private:tempArgs.Keys | ? {{ $allowedArgs -contains $_ }} | % {{ $private:taskArgs[$_] = $private:tempArgs[$_] }}
try {{
  & "{path}" @taskArgs
}} catch {{
  $Host.UI.WriteErrorLine("[$($_.FullyQualifiedErrorId)] Exception $($_.InvocationInfo.PositionMessage).`n$($_.Exception.Message)");
  exit 1;
}}
"#
    )
}

/// Call a script, turning exceptions into exit code 1
#[must_use]
pub fn try_catch_snippet(path: &str) -> String {
    format!("try {{ & \"{path}\" }} catch {{ Write-Error $_.Exception; exit 1 }}\n")
}

/// Set a process environment variable
#[must_use]
pub fn set_env_snippet(name: &str, value: &str) -> String {
    format!(
        "[Environment]::SetEnvironmentVariable({}, @'\n{value}\n'@)\n",
        quote(name)
    )
}

/// Definitions needed by task snippets (`Get-ContentAsJson`) plus the
/// Puppet agent's tool paths
#[must_use]
pub fn shell_init_snippet() -> &'static str {
    SHELL_INIT
}

/// Command line running `script` in a fresh `powershell.exe`
#[must_use]
pub fn encode_command(script: &str) -> String {
    let script = format!("$ProgressPreference = 'SilentlyContinue'\n{script}");
    let utf16: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    format!(
        "powershell.exe -NoProfile -NonInteractive -NoLogo -ExecutionPolicy Bypass -EncodedCommand {}",
        STANDARD.encode(utf16)
    )
}

fn extension(path: &str) -> Option<String> {
    // Windows paths use either separator
    let file = path.rsplit(['\\', '/']).next()?;
    let ext = Path::new(file).extension()?.to_str()?;
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

/// PowerShell shell for one target
#[derive(Debug, Clone)]
pub struct PowerShell {
    target: String,
    tmpdir: Option<String>,
    extensions: BTreeSet<String>,
}

impl PowerShell {
    /// Create a shell for `target`
    #[must_use]
    pub fn new(target: &Target) -> Self {
        let normalize = |ext: &str| {
            let ext = ext.to_ascii_lowercase();
            if ext.starts_with('.') { ext } else { format!(".{ext}") }
        };
        let mut extensions: BTreeSet<String> =
            DEFAULT_EXTENSIONS.iter().map(ToString::to_string).collect();
        extensions.extend(target.options.extensions.iter().map(|e| normalize(e)));
        extensions.extend(target.options.interpreters.keys().map(|e| normalize(e)));

        if target.options.run_as.is_some() {
            debug!(target_name = %target.name, "run-as is not supported by the PowerShell shell; ignoring");
        }

        Self {
            target: target.name.clone(),
            tmpdir: target.options.tmpdir.clone(),
            extensions,
        }
    }

    /// Reject file types that are not enabled for this target
    ///
    /// # Errors
    /// Returns `FILETYPE_ERROR` for an extension that is not enabled
    pub fn validate_extension(&self, filename: &str) -> Result<(), ExecError> {
        let ext = extension(filename).unwrap_or_default();
        if self.extensions.contains(&ext) {
            Ok(())
        } else {
            Err(ExecError::file(
                FileCode::Filetype,
                format!(
                    "File extension {ext} is not enabled, to run it please add to 'extensions'"
                ),
            ))
        }
    }

    /// Run a PowerShell script on `conn`
    ///
    /// # Errors
    /// Returns the connection's error if the script cannot be run
    pub async fn execute(
        &self,
        conn: &mut dyn Connection,
        script: &str,
    ) -> Result<CommandOutput, ExecError> {
        debug!(target_name = %self.target, "executing PowerShell script");
        conn.execute(&encode_command(script), None).await
    }

    /// Verify the shell works and the task helpers can be defined
    ///
    /// # Errors
    /// Returns `SHELL_INIT_ERROR` on failure
    pub async fn init(&self, conn: &mut dyn Connection) -> Result<(), ExecError> {
        let output = self.execute(conn, SHELL_INIT).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ExecError::ShellInit(output.error_message()))
        }
    }

    /// Create a temporary directory and return its path
    ///
    /// # Errors
    /// Returns `TEMPDIR_ERROR` on failure
    pub async fn make_tempdir(&self, conn: &mut dyn Connection) -> Result<String, ExecError> {
        let parent = match &self.tmpdir {
            Some(dir) => quote(dir),
            None => "[System.IO.Path]::GetTempPath()".to_string(),
        };
        let output = self.execute(conn, &make_tempdir_snippet(&parent)).await?;
        if !output.success() {
            return Err(ExecError::file(
                FileCode::Tempdir,
                format!("Could not make tempdir: {}", output.error_message()),
            ));
        }
        Ok(output.stdout_str().trim().to_string())
    }

    /// Remove a temporary directory; failures are logged
    pub async fn rmdir(&self, conn: &mut dyn Connection, dir: &str) {
        match self.execute(conn, &rmdir_snippet(dir)).await {
            Ok(output) if output.success() => debug!(path = %dir, "removed tempdir"),
            Ok(output) => warn!(
                path = %dir,
                "Failed to clean up tmpdir '{}': {}",
                dir,
                output.error_message()
            ),
            Err(e) => warn!(path = %dir, error = %e, "Failed to clean up tmpdir '{}'", dir),
        }
    }

    /// Remove a temporary directory unless the target disables cleanup
    pub async fn cleanup(&self, conn: &mut dyn Connection, dir: &str) {
        if conn.target().options.cleanup() {
            self.rmdir(conn, dir).await;
        } else {
            warn!(path = %dir, "Skipping cleanup of tmpdir {}", dir);
        }
    }

    /// Create directories
    ///
    /// # Errors
    /// Returns `MKDIR_ERROR` on failure
    pub async fn mkdirs(&self, conn: &mut dyn Connection, dirs: &[String]) -> Result<(), ExecError> {
        let output = self.execute(conn, &mkdirs_snippet(dirs)).await?;
        if !output.success() {
            return Err(ExecError::file(
                FileCode::Mkdir,
                format!("Could not create directories: {}", output.error_message()),
            ));
        }
        Ok(())
    }

    /// Upload `source` into `dir` after checking its extension
    ///
    /// # Errors
    /// Returns `FILETYPE_ERROR` or the upload error
    pub async fn write_executable(
        &self,
        conn: &mut dyn Connection,
        dir: &str,
        source: &Path,
        filename: Option<&str>,
    ) -> Result<String, ExecError> {
        let filename = match filename {
            Some(name) => name.to_string(),
            None => source
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| ExecError::Validation(format!("invalid file name: {}", source.display())))?
                .to_string(),
        };
        self.validate_extension(&filename)?;
        let remote_path = format!("{}\\{filename}", dir.trim_end_matches('\\'));
        conn.upload(source, &remote_path).await?;
        Ok(remote_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TransportKind;

    #[test]
    fn test_quote_doubles_single_quotes() {
        assert_eq!(quote("it's"), "'it''s'");
        assert_eq!(quote(r"C:\Temp\x"), r"'C:\Temp\x'");
    }

    #[test]
    fn test_escape_arguments() {
        let args = vec!["plain".to_string(), "with space".to_string()];
        assert_eq!(escape_arguments(&args), vec!["plain", "\"with space\""]);
    }

    #[test]
    fn test_process_from_extension() {
        let (program, args) = process_from_extension(r"C:\t\x.rb");
        assert_eq!(program, "ruby.exe");
        assert_eq!(args, vec!["-S".to_string(), r#""C:\t\x.rb""#.to_string()]);

        let (program, args) = process_from_extension(r"C:\t\x.PS1");
        assert_eq!(program, "powershell.exe");
        assert_eq!(args.last().map(String::as_str), Some(r#""C:\t\x.PS1""#));

        let (program, _) = process_from_extension(r"C:\t\x.pp");
        assert_eq!(program, "puppet.bat");

        let (program, args) = process_from_extension(r"C:\t\x.bat");
        assert_eq!(program, "cmd.exe");
        assert_eq!(args[0], "/c");
    }

    #[test]
    fn test_execute_process_with_stdin() {
        let script = execute_process("ruby.exe", &["-S".to_string()], Some("{\"a\":1}"));
        assert!(script.contains("@'\n{\"a\":1}\n'@ | & 'ruby.exe' '-S'"));
        assert!(script.trim_end().ends_with("exit $LASTEXITCODE"));
    }

    #[test]
    fn test_validate_extension() {
        let mut target = Target::new("win", TransportKind::Winrm);
        target.options.extensions = vec!["py".to_string()];
        let shell = PowerShell::new(&target);

        assert!(shell.validate_extension("task.ps1").is_ok());
        assert!(shell.validate_extension("task.py").is_ok());
        let err = shell.validate_extension("task.sh").unwrap_err();
        assert_eq!(err.issue_code(), "FILETYPE_ERROR");
    }

    #[test]
    fn test_encode_command_is_utf16le_base64() {
        let line = encode_command("exit 0");
        let encoded = line.rsplit(' ').next().unwrap();
        let bytes = STANDARD.decode(encoded).unwrap();
        let units: Vec<u16> = bytes
            .chunks(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let script = String::from_utf16(&units).unwrap();
        assert!(script.ends_with("exit 0"));
        assert!(line.starts_with("powershell.exe "));
    }

    #[test]
    fn test_ps_task_snippet_embeds_base64_args() {
        let args = serde_json::json!({"name": "x"});
        let snippet = ps_task_snippet(r"C:\t\task.ps1", &args);
        let encoded = STANDARD.encode(args.to_string());
        assert!(snippet.contains(&encoded));
        assert!(snippet.contains(r#"& "C:\t\task.ps1" @taskArgs"#));
    }
}
