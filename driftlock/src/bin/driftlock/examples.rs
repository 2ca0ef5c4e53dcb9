use crate::commands::{new, run, status};

#[derive(Clone, Copy)]
pub struct ExampleGroup {
    pub title: &'static str,
    pub commands: &'static [&'static str],
}

#[derive(Clone, Copy)]
pub struct CommandExample {
    pub name: &'static str,
    pub groups: &'static [ExampleGroup],
}

pub fn command_examples() -> &'static [CommandExample] {
    &[
        CommandExample {
            name: "up",
            groups: run::UP_EXAMPLES,
        },
        CommandExample {
            name: "down",
            groups: run::DOWN_EXAMPLES,
        },
        CommandExample {
            name: "status",
            groups: status::EXAMPLES,
        },
        CommandExample {
            name: "new",
            groups: new::EXAMPLES,
        },
    ]
}
