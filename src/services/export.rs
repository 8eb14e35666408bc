use crate::models::{Role, Session};

pub fn export_to_markdown(session: &Session, model: &str) -> String {
    let mut output = format!("# {}\n\n", session.title);
    output.push_str(&format!(
        "> Model: {} | Date: {}\n\n",
        model,
        session.created_at.format("%Y-%m-%d %H:%M")
    ));

    output.push_str("---\n\n");

    for msg in &session.messages {
        let role_label = match msg.role {
            Role::User => "You",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        output.push_str(&format!("### {}\n\n{}\n\n", role_label, msg.content));
    }

    output
}
