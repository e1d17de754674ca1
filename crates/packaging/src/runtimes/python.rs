use super::Template;

pub fn templates(entry: &str) -> Vec<Template> {
    vec![
        Template {
            path: "Dockerfile".to_string(),
            content: format!(
                r#"FROM python:3.11-slim

WORKDIR /app

# Dependencies first so source edits keep the install layer cached.
COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt

COPY . .

ENV PYTHONUNBUFFERED=1
CMD ["python", "{entry}"]
"#
            ),
        },
        Template {
            path: "requirements.txt".to_string(),
            content: "requests>=2.31\n".to_string(),
        },
        Template {
            path: entry.to_string(),
            content: r#"import signal
import sys


def shutdown(signum, frame):
    print(f"received signal {signum}, shutting down", flush=True)
    sys.exit(0)


signal.signal(signal.SIGTERM, shutdown)
print("ready", flush=True)
"#
            .to_string(),
        },
    ]
}
