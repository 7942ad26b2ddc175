//! Turning user arguments and image defaults into the init command line.

use super::ImageInfo;

fn shell(command: &[String]) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), command.join(" ")]
}

/// The argv init will exec.
///
/// - With a tty the user's arguments run as given.
/// - A shell-form entrypoint always runs as `sh -c "<entrypoint>"`.
/// - Without an entrypoint the user's arguments run through `sh -c`;
///   with none given, the image's CMD runs in its own form.
/// - An exec-form entrypoint receives the user's arguments (or the CMD)
///   joined into a single trailing argument.
#[must_use]
pub fn resolve_command(user: &[String], image: &ImageInfo, tty: bool) -> Vec<String> {
    if tty {
        return user.to_vec();
    }
    if image.entry_point_shell {
        return shell(&image.entry_point);
    }
    if image.entry_point.is_empty() {
        return match (user.is_empty(), image.cmd_shell) {
            (false, _) => shell(user),
            (true, true) => shell(&image.cmd),
            (true, false) => image.cmd.clone(),
        };
    }

    let mut argv = image.entry_point.clone();
    let args = if user.is_empty() { &image.cmd } else { user };
    argv.push(args.join(" "));
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn tty_runs_user_arguments_verbatim() {
        let image = ImageInfo::base();
        assert_eq!(resolve_command(&args(&["sh"]), &image, true), args(&["sh"]));
    }

    #[test]
    fn base_image_defaults() {
        let image = ImageInfo::base();
        assert_eq!(
            resolve_command(&[], &image, false),
            args(&["sh", "-c", "echo I am base image"])
        );
        assert_eq!(
            resolve_command(&args(&["top", "-b"]), &image, false),
            args(&["sh", "-c", "top -b"])
        );
    }

    #[test]
    fn shell_entrypoint_ignores_arguments() {
        let image = ImageInfo {
            entry_point: args(&["nginx", "-g", "daemon off;"]),
            entry_point_shell: true,
            ..ImageInfo::default()
        };
        assert_eq!(
            resolve_command(&args(&["ignored"]), &image, false),
            args(&["sh", "-c", "nginx -g daemon off;"])
        );
    }

    #[test]
    fn no_entrypoint() {
        let mut image = ImageInfo {
            cmd: args(&["echo", "hi"]),
            ..ImageInfo::default()
        };
        assert_eq!(resolve_command(&[], &image, false), args(&["echo", "hi"]));
        assert_eq!(
            resolve_command(&args(&["ls", "/"]), &image, false),
            args(&["sh", "-c", "ls /"])
        );

        image.cmd_shell = true;
        assert_eq!(
            resolve_command(&[], &image, false),
            args(&["sh", "-c", "echo hi"])
        );
    }
}
