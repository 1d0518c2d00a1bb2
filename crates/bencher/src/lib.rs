/// One benchmark input: a name, the group it is sized for and its content.
#[derive(Debug, Copy, Clone)]
pub struct TestCase {
    name: &'static str,
    group: TestGroup,
    input: TestInput,
}

impl TestCase {
    pub fn new(name: &'static str, group: TestGroup, input: TestInput) -> Self {
        Self { name, group, input }
    }

    pub fn small(name: &'static str, input: TestInput) -> Self {
        Self::new(name, TestGroup::Small, input)
    }

    pub fn normal(name: &'static str, input: TestInput) -> Self {
        Self::new(name, TestGroup::Normal, input)
    }

    pub fn large(name: &'static str, input: TestInput) -> Self {
        Self::new(name, TestGroup::Large, input)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn group(&self) -> TestGroup {
        self.group
    }

    pub fn input(&self) -> &TestInput {
        &self.input
    }

    pub fn bytes(&self) -> &'static [u8] {
        self.input.content
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TestInput {
    label: &'static str,
    content: &'static [u8],
}

impl TestInput {
    pub const fn new(label: &'static str, content: &'static [u8]) -> Self {
        Self { label, content }
    }

    pub fn content(&self) -> &'static [u8] {
        self.content
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

#[derive(Clone, Copy, Debug)]
pub enum TestGroup {
    Small,
    Normal,
    Large,
}
