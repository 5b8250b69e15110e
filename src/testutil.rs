//! Shell fake of the restic binary for tests.
//!
//! The script is run as `/bin/sh <script>` so the tests never exec a freshly
//! written file. Every invocation appends its subcommand to `calls.log`;
//! behaviour switches are plain flag files next to the script.

use crate::backup::process::ToolCommand;
use crate::backup::restic::Restic;
use crate::backup::Drive;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const SCRIPT: &str = r#"
here=$(dirname "$0")
cmd="$1"
shift
repo=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "--repo" ]; then repo="$arg"; fi
  prev="$arg"
done
echo "$cmd" >> "$here/calls.log"

flag() { [ -f "$here/flag.$1" ]; }

need_repo() {
  if [ ! -f "$repo/config" ]; then
    echo "Fatal: repository does not exist: unable to open config file" >&2
    echo "Is there a repository at the following location?" >&2
    exit 10
  fi
}

case "$cmd" in
  version)
    echo "restic 0.17.3 compiled with go1.22.5 on linux/amd64"
    ;;
  init)
    if flag init_fails; then echo "Fatal: create repository at $repo failed" >&2; exit 1; fi
    if [ -f "$repo/config" ]; then echo "Fatal: config file already exists" >&2; exit 1; fi
    mkdir -p "$repo" && : > "$repo/config" && : > "$repo/ids"
    echo "created restic repository at $repo"
    ;;
  snapshots)
    need_repo
    printf '['
    sep=''
    while IFS= read -r id; do
      [ -n "$id" ] || continue
      printf '%s{"time":"2024-05-01T10:00:00Z","paths":["/src"],"hostname":"fake","id":"%s","short_id":"%s"}' "$sep" "$id" "$id"
      sep=','
    done < "$repo/ids"
    printf ']\n'
    ;;
  unlock)
    if flag unlock_fails; then echo "Fatal: unable to remove lock" >&2; exit 1; fi
    need_repo
    echo "successfully removed 0 locks"
    ;;
  backup)
    need_repo
    printf '%s' "$RESTIC_PASSWORD" > "$here/backup_password"
    echo '{"message_type":"status","percent_done":0,"total_files":2,"files_done":0}'
    while flag hold; do sleep 0.05; done
    if flag noisy; then
      echo '{"message_type":"status","files_done":'
      printf '\377\376 not utf-8\n'
    fi
    echo 'using parent snapshot none'
    if flag backup_fails; then echo "Fatal: unable to save snapshot" >&2; exit 1; fi
    echo '{"message_type":"status","percent_done":1,"total_files":2,"files_done":2}'
    id="snap$(wc -l < "$repo/ids" | tr -d ' ')"
    echo "$id" >> "$repo/ids"
    echo "{\"message_type\":\"summary\",\"files_new\":2,\"snapshot_id\":\"$id\"}"
    ;;
  forget)
    need_repo
    grep -vx "$1" "$repo/ids" > "$repo/ids.tmp"
    mv "$repo/ids.tmp" "$repo/ids"
    echo "removed snapshot $1"
    ;;
  restore)
    need_repo
    grep -qx "$1" "$repo/ids" || { echo "Fatal: no matching ID found for prefix \"$1\"" >&2; exit 1; }
    mkdir -p "$3" && echo "$1" > "$3/restored-$1"
    ;;
  dump)
    printf 'tar:%s' "$2"
    ;;
  *)
    echo "unknown command $cmd" >&2
    exit 2
    ;;
esac
"#;

pub struct FakeRestic {
    dir: TempDir,
}

impl FakeRestic {
    pub const PASSWORD: &'static str = "correct horse battery staple";

    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("restic.sh"), SCRIPT).expect("write fake restic");
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn repo(&self) -> PathBuf {
        self.dir.path().join("repo")
    }

    pub fn command(&self) -> ToolCommand {
        ToolCommand::new("/bin/sh")
            .with_leading_args([self.dir.path().join("restic.sh").to_string_lossy().to_string()])
    }

    pub fn client(&self, source: &str) -> Restic {
        Restic::new(self.command(), self.repo(), Self::PASSWORD, PathBuf::from(source))
    }

    pub fn drive(&self, path: impl Into<PathBuf>, auto_backup: bool) -> Drive {
        Drive {
            path: path.into(),
            backup_path: self.repo(),
            credential: Self::PASSWORD.to_string(),
            auto_backup_enabled: auto_backup,
        }
    }

    pub fn set_flag(&self, name: &str) {
        std::fs::write(self.dir.path().join(format!("flag.{name}")), b"").expect("set flag");
    }

    pub fn clear_flag(&self, name: &str) {
        let _ = std::fs::remove_file(self.dir.path().join(format!("flag.{name}")));
    }

    pub fn add_snapshot(&self, id: &str) {
        use std::io::Write;
        let mut ids = std::fs::OpenOptions::new()
            .append(true)
            .open(self.repo().join("ids"))
            .expect("repository initialized");
        writeln!(ids, "{id}").expect("append id");
    }

    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn count(&self, subcommand: &str) -> usize {
        self.calls().iter().filter(|c| *c == subcommand).count()
    }

    pub fn last_backup_password(&self) -> Option<String> {
        std::fs::read_to_string(self.dir.path().join("backup_password")).ok()
    }
}
